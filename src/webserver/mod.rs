/// HTTP surface consumed by the dashboard and by webhook deliveries
pub mod routes;
pub mod server;
pub mod state;
pub mod utils;

pub use server::start_server;
pub use state::AppState;
