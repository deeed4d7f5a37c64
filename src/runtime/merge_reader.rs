use crate::errors::PipeError;
use crate::pipe::PipeReader;

/// Reads a sequence of pipes as one stream: each source is drained to
/// end-of-stream before the next one starts. This is how a parameter that
/// resolves to several nodes is presented to an actor: concatenated in
/// declaration order.
pub struct MergeReader {
    readers: Vec<PipeReader>,
    current: usize,
}

impl MergeReader {
    pub fn new(readers: Vec<PipeReader>) -> Self {
        Self {
            readers,
            current: 0,
        }
    }

    pub fn single(reader: PipeReader) -> Self {
        Self::new(vec![reader])
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, PipeError> {
        while self.current < self.readers.len() {
            let n = self.readers[self.current].read(buf).await?;
            if n > 0 {
                return Ok(n);
            }
            self.current += 1;
        }
        Ok(0)
    }

    pub fn close(&mut self) {
        for reader in &mut self.readers {
            reader.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationQueue;
    use crate::pipe::Pipe;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concatenates_in_order() {
        let queue = Arc::new(NotificationQueue::new());
        let first = Pipe::new(&queue, "first");
        let second = Pipe::new(&queue, "second");
        first.write_now(b"ab").unwrap();
        first.close();
        second.write_now(b"cd").unwrap();
        second.close();

        let mut merged = MergeReader::new(vec![first.open_reader(), second.open_reader()]);
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = merged.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcd");
    }

    #[tokio::test]
    async fn test_poison_surfaces_mid_merge() {
        let queue = Arc::new(NotificationQueue::new());
        let ok = Pipe::new(&queue, "ok");
        let bad = Pipe::new(&queue, "bad");
        ok.write_now(b"x").unwrap();
        ok.close();
        bad.poison();

        let mut merged = MergeReader::new(vec![ok.open_reader(), bad.open_reader()]);
        let mut buf = [0u8; 8];
        assert_eq!(merged.read(&mut buf).await.unwrap(), 1);
        assert_eq!(merged.read(&mut buf).await, Err(PipeError::Poisoned));
    }

    #[tokio::test]
    async fn test_empty_set_is_immediate_eof() {
        let mut merged = MergeReader::new(vec![]);
        let mut buf = [0u8; 8];
        assert_eq!(merged.read(&mut buf).await.unwrap(), 0);
    }
}
