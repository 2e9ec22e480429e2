use crate::limits::MAX_SIMULATION_TIME_SECS;
use crate::model::*;

use super::EngineError;

/// Setup/teardown time added around every queued run.
pub const QUEUE_BUFFER_SECS: i64 = 120;

/// Width of the window a queued run blocks out, in ms.
pub(crate) fn queued_duration_ms(simulation_time_secs: i64) -> Result<Ms, EngineError> {
    if simulation_time_secs <= 0 {
        return Err(EngineError::InvalidDuration(simulation_time_secs));
    }
    if simulation_time_secs > MAX_SIMULATION_TIME_SECS {
        return Err(EngineError::LimitExceeded("simulation time too long"));
    }
    Ok((simulation_time_secs + QUEUE_BUFFER_SECS) * 1_000)
}

/// Earliest `[start, start + duration)` at or after `now` that does not
/// intersect any of `reservations`.
///
/// `reservations` must be sorted by start and pairwise disjoint, which the
/// device state guarantees. Under that invariant their ends are sorted too,
/// so everything that finished by `now` can be skipped with one binary
/// search and the rest is a single forward pass: the cursor only moves
/// forward, and each candidate gap is bounded by the next reservation.
pub fn place_queued(reservations: &[Reservation], duration: Ms, now: Ms) -> Span {
    let mut proposed = now;
    let first_live = reservations.partition_point(|r| r.span.end <= now);

    for r in &reservations[first_live..] {
        if r.span.end <= proposed {
            continue;
        }
        if proposed + duration <= r.span.start {
            break;
        }
        proposed = r.span.end;
    }

    let start = proposed.max(now);
    Span::new(start, start + duration)
}
