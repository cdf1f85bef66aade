//! Process-wide I/O runtime. All socket work runs here; application threads
//! hand work to it and never block on sockets themselves.

use tokio::runtime::{Handle, Runtime};

lazy_static::lazy_static! {
    static ref RUNTIME: Runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("robo-io")
        .build()
        .expect("Failed to create fabric I/O runtime");
}

pub fn io_runtime() -> &'static Runtime {
    &RUNTIME
}

pub fn io_handle() -> Handle {
    RUNTIME.handle().clone()
}
