mod debouncer;
mod queue;
mod timeout;
