pub(crate) mod scoped_timer;
pub(crate) mod time;
