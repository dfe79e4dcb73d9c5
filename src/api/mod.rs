mod context;
pub mod handlers;
pub mod response;
mod routes;

pub use context::{UploadContext, UPLOAD_TOKEN_HEADER};
pub use routes::create_router;
