mod status_server;

pub use status_server::{router, StatusServer, StatusState};
