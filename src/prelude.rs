pub use crate::app::App;
pub use crate::args;
pub use crate::chanrpc::{Args, Client, FunctionId, Handler, Server, ServerHandle, Value};
pub use crate::config::RuntimeConfig;
pub use crate::console::{CommandRegistry, Console, ConsoleConfig};
pub use crate::error::RpcError;
pub use crate::module::{Agent, CloseSignal, Module, ModuleManager, Skeleton, SkeletonConfig};
pub use crate::pool::{LinearContext, Pool};
pub use crate::timer::{Cron, CronExpr, Dispatcher, Timer};
