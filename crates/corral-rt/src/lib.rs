// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! corral runtime: structured concurrency with coroutines and channels.
//!
//! Coroutines are immutable chains of steps. A scope runs them either on
//! its worker pool (`run_async`) or on the calling thread
//! (`run_blocking`), hands back a [`Continuation`] for each run, and does
//! not return from [`launch`] until every run it started is done.
//!
//! Runs talk through typed, bounded channels looked up by id in the
//! scope's context. A [`select`] step waits on several channel operations
//! and commits to exactly one of them.
//!
//! Suspension is thread parking, not stack switching: a blocking run parks
//! its thread; an async run hands its worker back and is resubmitted when
//! the channel operation it waits on completes.
//!
//! ```no_run
//! use corral_rt::{first, launch, receive, select, string_channel};
//!
//! let a = string_channel("A");
//! let b = string_channel("B");
//! let either = first(select(receive(&a)).or(receive(&b)));
//!
//! launch(|scope| {
//!     let cont = scope.run_async(&either, ());
//!     scope.get_channel(&b).send_blocking("hello".to_string()).unwrap();
//!     assert_eq!(cont.get_result().unwrap(), "hello");
//! })
//! .unwrap();
//! ```

mod cancel;
mod channel;
mod context;
mod continuation;
mod coroutine;
mod pool;
mod run;
mod scope;
mod select;
mod step;
mod waiter;

pub use cancel::CancelToken;
pub use channel::{
    bool_channel, int_channel, string_channel, Channel, ChannelId, RecvError, SendError,
    TryRecvError, TrySendError,
};
pub use context::{
    default_context, reset_default_context, set_default_context, ConfigKey, Context,
    ExceptionHandler, CHANNEL_CAPACITY, DEFAULT_CHANNEL_CAPACITY, EXCEPTION_HANDLER, FAIL_FAST,
    WORKER_THREADS,
};
pub use continuation::{Continuation, CoroutineError, RunState};
pub use coroutine::{first, Coroutine};
pub use scope::{launch, launch_in, CoroutineScope};
pub use select::{select, Select};
pub use step::{apply, receive, send, send_with, supply, try_apply, Step};
