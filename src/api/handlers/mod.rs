mod files;
mod health;
mod uploads;

pub use files::{add_declared_file, add_file, get_file, get_stream, remove_file, FileResponse};
pub use health::health;
pub use uploads::{create_upload, get_upload, remove_upload, UploadResponse};
