mod request;

pub use request::{ControlError, Request, error_line};
