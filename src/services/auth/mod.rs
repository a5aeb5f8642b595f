pub mod password;
pub mod token;

pub use password::PasswordService;
pub use token::TokenManager;
