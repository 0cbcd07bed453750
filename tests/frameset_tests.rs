use framefarm::error::FarmError;
use framefarm::frameset::FrameSet;

fn set(range: &str) -> FrameSet {
    FrameSet::parse(range).unwrap()
}

#[test]
fn test_stringified_ranges_parse_back() {
    for range in [
        "1-10",
        "10-1",
        "1-20x3",
        "1-20x-3",
        "-5--1",
        "1,3,5,7,9,20",
        "1-100:7",
        "4,2,9,9,1-3",
        "1001",
    ] {
        let parsed = set(range);
        let reparsed = set(&parsed.to_string());
        assert_eq!(
            parsed.normalized(),
            reparsed.normalized(),
            "{} -> {}",
            range,
            parsed
        );
    }
}

#[test]
fn test_chunks_cover_the_set() {
    let frames = set("1-37x2,100-90");
    for size in [1, 2, 5, 7, 100] {
        let chunks = frames.chunk(size);
        assert!(chunks.iter().all(|c| c.len() <= size && !c.is_empty()));

        let mut rebuilt = FrameSet::empty();
        for chunk in &chunks {
            rebuilt = rebuilt.union(chunk);
        }
        assert_eq!(rebuilt.normalized(), frames.normalized());
    }
}

#[test]
fn test_intersect_with_unspecified_side() {
    let frames = set("1-10");
    assert_eq!(frames.intersect(&FrameSet::empty()), frames);
    assert_eq!(FrameSet::empty().intersect(&frames), frames);
}

#[test]
fn test_intersect_keeps_exactly_common_frames() {
    let a = set("1-20");
    let b = set("15-30x5");
    let common = a.intersect(&b);
    assert_eq!(common.frames(), &[15, 20]);

    for f in -5..40 {
        assert_eq!(common.contains(f), a.contains(f) && b.contains(f), "frame {}", f);
    }
}

#[test]
fn test_disjoint_ranges_intersect_to_nothing() {
    assert!(set("1000-1010").intersect(&set("1100-1200")).is_empty());
}

#[test]
fn test_chunking_windows() {
    let frames = set("1-10");
    let chunks = frames.chunk(5);
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].frames(), &[1, 2, 3, 4, 5]);
    assert_eq!(chunks[1].frames(), &[6, 7, 8, 9, 10]);

    assert_eq!(frames.local_frame_set(1, 5).unwrap().frames(), &[1, 2, 3, 4, 5]);
    assert_eq!(frames.local_frame_set(6, 5).unwrap().frames(), &[6, 7, 8, 9, 10]);
    assert_eq!(frames.local_frame_set(8, 5).unwrap().frames(), &[8, 9, 10]);
}

#[test]
fn test_local_frame_set_rejects_unknown_leader() {
    assert!(set("1-10").local_frame_set(11, 5).is_err());
}

#[test]
fn test_malformed_ranges_are_syntax_errors() {
    for range in ["", "a-b", "1-", "1-10y2", "1-10x0", "1-10:0", "1--", "1-10x2z"] {
        assert!(
            matches!(FrameSet::parse(range), Err(FarmError::RangeSyntax { .. })),
            "{:?} should not parse",
            range
        );
    }
}

#[test]
fn test_display_compresses_strided_runs() {
    assert_eq!(set("1-10").to_string(), "1-10");
    assert_eq!(set("1-9x2").to_string(), "1-9x2");
    assert_eq!(set("1,2,3,10").to_string(), "1-3,10");
}

#[test]
fn test_ranges_at_the_integer_limits() {
    let top = set("9223372036854775806-9223372036854775807");
    assert_eq!(top.frames(), &[i64::MAX - 1, i64::MAX]);
    assert_eq!(set(&top.to_string()), top);

    let bottom = set("-9223372036854775808--9223372036854775807");
    assert_eq!(bottom.frames(), &[i64::MIN, i64::MIN + 1]);

    let extremes = set("-9223372036854775808,9223372036854775807");
    assert_eq!(extremes.to_string(), "-9223372036854775808,9223372036854775807");
}

#[test]
fn test_extreme_steps_do_not_panic() {
    assert_eq!(set("1-5x-9223372036854775808").frames(), &[1]);
    assert_eq!(set("1-5x9223372036854775807").frames(), &[1]);
    assert_eq!(set("9223372036854775800-9223372036854775807x5").frames(), &[9223372036854775800, 9223372036854775805]);
}

#[test]
fn test_oversized_expansion_is_a_syntax_error() {
    for range in [
        "1-9223372036854775807",
        "-9223372036854775808-9223372036854775807",
        "1-10:2000000",
        "1-600000,1-600000",
    ] {
        assert!(
            matches!(FrameSet::parse(range), Err(FarmError::RangeSyntax { .. })),
            "{:?} should be refused",
            range
        );
    }
}
