//! ---
//! cosim_section: "03-logging"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Structured logging adapters for simulator lifecycles."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
//! Context-carrying logging macros.
//!
//! Every macro accepts an optional leading `context = <LogContext>` followed by
//! `format!`-style arguments. Events without context carry empty fields so that
//! log queries can rely on `sim`, `step` and `phase` always being present.

#[doc(hidden)]
#[macro_export]
macro_rules! __sim_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx: &$crate::LogContext<'_> = &$ctx;
        tracing::event!(
            $level,
            sim = ctx.sim.unwrap_or(""),
            step = ctx.step.unwrap_or(-1),
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Informational event with simulator context.
#[macro_export]
macro_rules! sim_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__sim_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__sim_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Debug event with simulator context.
#[macro_export]
macro_rules! sim_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__sim_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__sim_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Warning with simulator context.
#[macro_export]
macro_rules! sim_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__sim_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__sim_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}
