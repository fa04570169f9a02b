// Administrative HTTP surface (migrate, rotate, status)

pub mod admin;

pub use admin::{create_admin_router, AdminAppState, BatchParams};
