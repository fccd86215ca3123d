mod responses;
pub mod router;
mod state;
mod templates;

pub use responses::{ApiMessage, json_error};
pub use state::AppState;
pub use templates::escape_html;
