pub mod client;
pub mod interceptor;
pub mod transport;

pub use client::ApiClient;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, UreqTransport};
