use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Bounds check for a caller-supplied window. `start < end` first, so an
/// inverted interval is reported as such regardless of anything else.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::checked(start, end).ok_or(EngineError::InvalidInterval { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// First existing reservation on `device` that intersects `span`, ignoring
/// `exclude` (the reservation being updated).
pub(crate) fn find_conflict<'a>(
    device: &'a DeviceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    device
        .overlapping(span)
        .find(|r| Some(r.id) != exclude)
}

pub(crate) fn check_no_conflict(
    device: &DeviceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(device, span, exclude) {
        Some(blocking) => {
            tracing::debug!(
                device_id = %device.id,
                blocking = %blocking.id,
                start = span.start,
                end = span.end,
                "reservation conflict"
            );
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict {
                device_id: device.id,
                reservation_id: blocking.id,
            })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_with(spans: &[(Ms, Ms)]) -> DeviceState {
        let mut d = DeviceState::new(Ulid::new(), "oscilloscope".into(), None, 0);
        for &(start, end) in spans {
            d.insert_reservation(Reservation {
                id: Ulid::new(),
                device_id: d.id,
                span: Span::new(start, end),
                queued: false,
                created_at: 0,
                modified_at: 0,
            });
        }
        d
    }

    #[test]
    fn inverted_and_empty_windows_are_invalid() {
        assert!(matches!(
            validate_span(20, 10),
            Err(EngineError::InvalidInterval { start: 20, end: 10 })
        ));
        assert!(matches!(
            validate_span(10, 10),
            Err(EngineError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn inverted_window_beats_range_check() {
        assert!(matches!(
            validate_span(MAX_VALID_TIMESTAMP_MS + 10, -10),
            Err(EngineError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn out_of_range_and_too_wide() {
        assert!(matches!(
            validate_span(-1, 10),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(0, MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
    }

    #[test]
    fn touching_boundaries_do_not_conflict() {
        let d = device_with(&[(10, 20)]);
        assert!(check_no_conflict(&d, &Span::new(20, 30), None).is_ok());
        assert!(check_no_conflict(&d, &Span::new(0, 10), None).is_ok());
    }

    #[test]
    fn any_intersection_conflicts() {
        let d = device_with(&[(10, 20)]);
        for (s, e) in [(5, 11), (19, 25), (12, 18), (0, 100), (10, 20)] {
            assert!(
                matches!(
                    check_no_conflict(&d, &Span::new(s, e), None),
                    Err(EngineError::Conflict { .. })
                ),
                "[{s}, {e}) should conflict with [10, 20)"
            );
        }
    }

    #[test]
    fn conflict_names_the_blocking_reservation() {
        let d = device_with(&[(0, 5), (10, 20), (30, 40)]);
        let blocking = d.reservations[1].id;
        match check_no_conflict(&d, &Span::new(15, 25), None) {
            Err(EngineError::Conflict { device_id, reservation_id }) => {
                assert_eq!(device_id, d.id);
                assert_eq!(reservation_id, blocking);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn excluded_reservation_is_ignored() {
        let d = device_with(&[(10, 20)]);
        let own = d.reservations[0].id;
        assert!(check_no_conflict(&d, &Span::new(12, 25), Some(own)).is_ok());
    }

    #[test]
    fn exclusion_does_not_hide_other_conflicts() {
        let d = device_with(&[(10, 20), (20, 30)]);
        let own = d.reservations[0].id;
        let other = d.reservations[1].id;
        match find_conflict(&d, &Span::new(15, 25), Some(own)) {
            Some(r) => assert_eq!(r.id, other),
            None => panic!("expected the neighbour to conflict"),
        }
    }
}
