mod cleaner;

pub use cleaner::start_session_cleaner;
