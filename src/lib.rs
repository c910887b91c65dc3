pub mod config;
pub mod dispatch;
pub mod engine;
pub mod exception;
pub mod form;
pub mod param;
pub mod parser;
pub mod pipeline;
pub mod post;
pub mod reactor;
pub mod request;
pub mod response;
pub mod server;
pub mod tcp;
pub mod timer;
pub mod util;
pub mod wake;

pub use config::Config;
pub use engine::{ConnectionControl, ConnectionHandler, ConnectionId, Disposition, Engine, Flow};
pub use exception::Exception;
pub use param::{HttpRequestMethod, HttpVersion};
pub use pipeline::{Middleware, Pipeline};
pub use reactor::{Reactor, ReactorHandle, ReactorStats};
pub use request::Request;
pub use response::{OutputStream, Response};
pub use server::Httpd;
pub use timer::TimerId;
pub use util::HtmlBuilder;
