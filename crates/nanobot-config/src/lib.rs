mod loader;
mod schema;

pub use loader::{config_dir, config_path, expand_path, load_config, save_config};
pub use schema::*;
