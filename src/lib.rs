pub mod config;
pub mod error;
pub mod file_server;
pub mod port_manager;
pub mod project_id;
pub mod server_manager;
pub mod token;

pub use config::Config;
pub use error::ServerError;
pub use file_server::ProjectFileServer;
pub use project_id::ProjectId;
pub use server_manager::{ManagerStats, ProjectStats, ServerManager};
pub use token::AccessToken;
