//! HTTP API handlers for loom-ai

pub mod health;
pub mod images;
pub mod jobs;
pub mod text;

pub use health::health_routes;
pub use images::image_routes;
pub use jobs::job_routes;
pub use text::text_routes;
