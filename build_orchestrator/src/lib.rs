//! Container image builds against a Podman compatible daemon.
//!
//! A build goes through [context::package] (the context becomes a tar
//! archive), [BuildOptions::to_query_params] (the options become query
//! parameters), one streamed `POST /build` over a [Transport], and finally
//! [interpreter::interpret] which reads the outcome out of the daemon's event
//! stream. [ImageBuilder::build] does all of it.
//!
//! The daemon reports success or failure only in the body of the response, so
//! every build hands back a [BuildLog] that replays the whole event stream,
//! also when the build failed (see [BuildError::Build]).

mod builder;
/// Daemon address and file based build options
pub mod config;
/// Turning build contexts into request bodies
pub mod context;
mod error;
mod events;
mod image;
/// Scanning the event stream for the outcome of a build
pub mod interpreter;
mod options;
mod tee;
#[cfg(test)]
mod test_support;
/// The HTTP side of the daemon API
pub mod transport;

pub use builder::*;
pub use config::ClientConfig;
pub use context::{BuildContext, ContextSources};
pub use error::*;
pub use events::*;
pub use image::*;
pub use options::*;
pub use tee::*;
pub use transport::{HttpTransport, Transport};
