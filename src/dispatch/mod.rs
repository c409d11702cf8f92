pub mod dispatcher;
pub mod feed;
pub mod intake;
pub mod listener;
pub mod lock;
pub mod poller;
pub mod quota;
pub mod scheduler;
pub mod sender;
pub mod state;

pub use dispatcher::{Consideration, DispatchError, Dispatcher, RunReport};
pub use intake::{Intake, TriggerSource, WorkItem};
