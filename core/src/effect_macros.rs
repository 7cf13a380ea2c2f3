//! Declarative macros for ergonomic effect construction

/// Create an `Effect::Future` from an async block
///
/// # Example
///
/// ```rust,ignore
/// use trailhead_core::async_effect;
///
/// async_effect! {
///     let count = gateway.count_with_status(hike_id, EnrollmentStatus::Enrolled).await;
///     Some(EnrollmentAction::CountLoaded { request_id, count })
/// }
/// ```
#[macro_export]
macro_rules! async_effect {
    ($($body:tt)*) => {
        $crate::effect::Effect::Future(
            ::std::boxed::Box::pin(async move { $($body)* })
        )
    };
}

/// Create an `Effect::Delay` for scheduling delayed actions
///
/// # Example
///
/// ```rust,ignore
/// use trailhead_core::delay;
/// use std::time::Duration;
///
/// delay! {
///     duration: Duration::from_secs(1),
///     action: VerificationAction::CheckLiveness { epoch }
/// }
/// ```
#[macro_export]
macro_rules! delay {
    (
        duration: $duration:expr,
        action: $action:expr
    ) => {
        $crate::effect::Effect::Delay {
            duration: $duration,
            action: ::std::boxed::Box::new($action),
        }
    };
}

/// Create an `Effect::Future` that immediately feeds `action` back
///
/// Used by reducers that must answer a request synchronously but still want
/// the answer observable through the store's action broadcast.
#[macro_export]
macro_rules! emit {
    ($action:expr) => {{
        let action = $action;
        $crate::effect::Effect::Future(::std::boxed::Box::pin(async move { Some(action) }))
    }};
}
