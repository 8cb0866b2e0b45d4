mod support;

mod invalidation;
mod legacy;
mod lifecycle;
mod notifications;
