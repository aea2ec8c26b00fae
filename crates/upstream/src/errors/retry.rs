/// Classification for retry policy.
///
/// Used by the transport and the credential rotator to decide what happens
/// after a failed upstream call.
///
/// # Behavior Summary
///
/// | Class | Retry same request? | Try next credential? | Mark credential failed? |
/// |-------|--------------------|----------------------|-------------------------|
/// | `Retry` | Yes (within budget) | Yes, once exhausted | Yes |
/// | `NextCredential` | No | Yes | Yes |
/// | `Never` | No | No | No |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Transient failure (connection error, 429, 5xx gateway errors).
    /// The transport retries it with exponential backoff.
    Retry,

    /// The request failed for this credential and retrying it won't help.
    ///
    /// Used for terminal HTTP statuses, unreadable bodies and exhausted
    /// retry budgets. The rotator puts the credential into cooldown and moves
    /// on to the next one.
    NextCredential,

    /// Abort immediately.
    ///
    /// Cancellation, invalid endpoint templates and local configuration
    /// errors. No credential is at fault, so none is penalised.
    Never,
}
