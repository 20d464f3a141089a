#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(dead_code)]
    #![allow(unused_imports)]

    pub(crate) use loom::{model, thread};

    pub(crate) mod sync {
        pub(crate) use loom::sync::{atomic, Arc};
    }
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code)]
    #![allow(unused_imports)]

    pub(crate) mod sync {
        pub(crate) use std::sync::{atomic, Arc};
    }

    #[cfg(test)]
    pub(crate) use std::thread;

    #[cfg(test)]
    pub(crate) fn model(f: impl FnOnce()) {
        let collector = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .without_time()
            .with_thread_ids(true)
            .with_thread_names(true)
            .finish();
        let _ = tracing::subscriber::set_global_default(collector);
        f()
    }
}
