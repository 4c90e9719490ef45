mod cdp;
mod chromium;
mod classify;
mod client;
mod error;
mod remote;
mod stealth;

pub(crate) use client::js_string;

pub use chromium::ChromiumClient;
pub use classify::{classify, is_retryable, ErrorKind};
pub use client::{build_client, BackendKind, BrowserClient, ElementProbe, WaitCondition};
pub use error::{BrowserError, BrowserResult};
pub use remote::RemoteClient;
pub use stealth::StealthClient;
