//! Set the admin password from the command line
//!
//! Usage: set_password <password>
//!
//! Writes `<DATA_DIR>/config/password`, the file the agent reads, replacing
//! any existing password.

use arrival_board_agent::{config::AppConfig, services::auth::PasswordService};
use std::env;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 || args[1].is_empty() {
        eprintln!("Usage: {} <password>", args[0]);
        std::process::exit(1);
    }

    let passwords = PasswordService::new(&AppConfig::get().paths.password_file);

    match passwords.store_or_update_password(&args[1]) {
        Ok(()) => println!("Password file written successfully"),
        Err(e) => {
            eprintln!("Failed to write password file: {e:#}");
            std::process::exit(1);
        }
    }
}
