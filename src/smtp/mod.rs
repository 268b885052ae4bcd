//! Minimal SMTP listener feeding the relay pipeline.

pub mod response;
pub mod server;
pub mod session;

pub use response::Reply;
pub use server::{ShutdownOutcome, SmtpServer};
pub use session::{Action, DataCollector, Session};
