//! Property tests for CSN ordering and textual round-trips.

use dirsync_types::Csn;
use proptest::prelude::*;

fn arb_csn() -> impl Strategy<Value = Csn> {
    (any::<u64>(), any::<u32>(), any::<i32>()).prop_map(|(t, s, id)| Csn::new(t, s, id))
}

proptest! {
    #[test]
    fn display_parse_round_trip(csn in arb_csn()) {
        let parsed: Csn = csn.to_string().parse().unwrap();
        prop_assert_eq!(parsed, csn);
    }

    #[test]
    fn order_is_total_and_antisymmetric(a in arb_csn(), b in arb_csn()) {
        if a != b {
            prop_assert!(a.is_newer_than(&b) != b.is_newer_than(&a));
        } else {
            prop_assert!(a.is_older_or_equal(&b) && b.is_older_or_equal(&a));
        }
    }

    #[test]
    fn time_dominates_order(t1 in any::<u64>(), t2 in any::<u64>(),
                            s1 in any::<u32>(), s2 in any::<u32>(),
                            id1 in any::<i32>(), id2 in any::<i32>()) {
        prop_assume!(t1 < t2);
        prop_assert!(Csn::new(t2, s2, id2).is_newer_than(&Csn::new(t1, s1, id1)));
    }

    #[test]
    fn window_end_covers_whole_millisecond(t in any::<u64>(), s in any::<u32>(), id in any::<i32>()) {
        prop_assert!(Csn::new(t, s, id).is_older_or_equal(&Csn::window_end(t, id)));
    }

    #[test]
    fn sorted_vec_matches_ord(mut csns in proptest::collection::vec(arb_csn(), 0..32)) {
        csns.sort();
        for pair in csns.windows(2) {
            prop_assert!(pair[0].is_older_or_equal(&pair[1]));
        }
    }
}
