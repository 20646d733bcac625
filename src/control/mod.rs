// Session control: command input, reporting, shutdown and the worker loop
pub mod bot;
pub mod commands;
pub mod reporter;
pub mod shutdown;

pub use bot::{BotState, TradingBot};
pub use commands::{read_commands, Command, Toggle};
pub use reporter::{ReportCapture, ReportKind, Reporter};
pub use shutdown::{ShutdownHandle, ShutdownReason};
