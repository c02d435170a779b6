pub(crate) mod logs;
pub(crate) mod sources;
pub(crate) mod status;
pub(crate) mod watchers;
pub(crate) mod webhooks;
