pub mod index_page;
pub mod server;

pub use server::WebServer;
