pub mod progress;

pub use progress::{ProgressActor, ProgressArguments, ProgressMsg};
