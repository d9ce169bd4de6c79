//! Backing collaborators for the session store.

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "file")]
pub use file::FileBackend;
#[cfg(feature = "http")]
pub use http::HttpBackend;
#[cfg(feature = "memory")]
pub use memory::MemoryBackend;
