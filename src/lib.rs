pub mod actors;      // built-in actor bodies
pub mod environment; // assembly + lifecycle
pub mod errors;      // error handling
pub mod graph;       // DAG store + workflow templates
pub mod kv;          // key-stream store
pub mod notify;      // notification queue
pub mod pipe;        // broadcast byte pipe
pub mod runtime;     // per-actor I/O facade
pub mod scheduler;   // cooperative driver
