pub use session::ClientSession;

mod session;
