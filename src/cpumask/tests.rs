use super::*;
use proptest::{collection::vec, prelude::*};

fn mask_from(nr_cpus: usize, bits: &[bool]) -> Cpumask {
    let mut mask = Cpumask::new(nr_cpus);
    for (cpu, _) in bits.iter().enumerate().filter(|(_, &set)| set) {
        mask.set(cpu).unwrap();
    }
    mask
}

/// Two masks of the same size.
fn mask_pair() -> impl Strategy<Value = (Cpumask, Cpumask)> {
    (1usize..200).prop_flat_map(|nr| {
        (vec(any::<bool>(), nr), vec(any::<bool>(), nr))
            .prop_map(move |(a, b)| (mask_from(nr, &a), mask_from(nr, &b)))
    })
}

#[test]
fn single_bits() {
    let mut mask = Cpumask::new(70);
    assert!(mask.is_empty());
    assert_eq!(mask.test_and_set(69), Ok(false));
    assert_eq!(mask.test_and_set(69), Ok(true));
    assert_eq!(mask.test(69), Ok(true));
    mask.set(3).unwrap();
    assert_eq!(mask.weight(), 2);
    assert_eq!(mask.test_and_clear(3), Ok(true));
    assert_eq!(mask.test_and_clear(3), Ok(false));
    mask.clear(69).unwrap();
    assert!(mask.is_empty());
}

#[test]
fn out_of_range_fails_closed() {
    let mut mask = Cpumask::new(4);
    let err = BoundsError { index: 4, len: 4 };
    assert_eq!(mask.set(4), Err(err));
    assert_eq!(mask.clear(4), Err(err));
    assert_eq!(mask.test(4), Err(err));
    assert_eq!(mask.test_and_set(4), Err(err));
    assert_eq!(mask.test_and_clear(4), Err(err));
    assert!(mask.is_empty());
}

#[test]
fn set_all_respects_size() {
    for nr in [1, 63, 64, 65, 128, 130] {
        let mask = Cpumask::full(nr);
        assert!(mask.is_full(), "{nr}");
        assert_eq!(mask.weight(), nr);
        assert_eq!(mask.first_zero(), None);
        assert!(mask.complement().is_empty());
    }
}

#[test]
fn first_and_first_zero() {
    let mut mask = Cpumask::new(130);
    assert_eq!(mask.first(), None);
    assert_eq!(mask.first_zero(), Some(0));
    mask.set(0).unwrap();
    mask.set(1).unwrap();
    mask.set(100).unwrap();
    assert_eq!(mask.first(), Some(0));
    assert_eq!(mask.first_zero(), Some(2));

    let mut other = Cpumask::new(130);
    other.set(100).unwrap();
    other.set(129).unwrap();
    assert_eq!(mask.first_and(&other), Some(100));
}

#[test]
fn iter_yields_set_bits() {
    let mask = Cpumask::from_hex("0x8000_0000_0000_0001_0000_0000_0000_0005", 128).unwrap();
    let cpus: Vec<CpuId> = mask.iter().collect();
    assert_eq!(cpus, [0, 2, 64, 127]);
}

#[test]
fn pick_any_is_distributed() {
    let mut mask = Cpumask::new(8);
    for cpu in [1, 3, 5, 7] {
        mask.set(cpu).unwrap();
    }
    let mut seen = Cpumask::new(8);
    for _ in 0..64 {
        let cpu = mask.pick_any().unwrap();
        assert!(mask.test(cpu).unwrap());
        seen.set(cpu).unwrap();
    }
    // A rotating start point must eventually hit every candidate, rather
    // than always returning the lowest one.
    assert_eq!(seen, mask);
    assert_eq!(Cpumask::new(8).pick_any(), None);
}

#[test]
fn pick_any_and_stays_in_intersection() {
    let a = Cpumask::from_hex("0xf0", 8).unwrap();
    let b = Cpumask::from_hex("0x3c", 8).unwrap();
    for _ in 0..16 {
        let cpu = a.pick_any_and(&b).unwrap();
        assert!(cpu == 4 || cpu == 5, "{cpu}");
    }
    let c = Cpumask::from_hex("0x0f", 8).unwrap();
    assert_eq!(a.pick_any_and(&c), None);
}

#[test]
fn parse_and_display() {
    let mask: Cpumask = "0xff00_ff00".parse().unwrap();
    assert_eq!(mask.nr_cpus(), 32);
    assert_eq!(mask.weight(), 16);
    assert_eq!(mask.to_string(), "32:0xff00ff00");

    let wide = Cpumask::from_hex("1_0000000000000000", 72).unwrap();
    assert_eq!(wide.to_string(), "72:0x10000000000000000");
    assert_eq!(Cpumask::new(4).to_string(), "4:0x0");

    assert_eq!("0x".parse::<Cpumask>(), Err(ParseCpumaskError::Empty));
    assert_eq!(
        "0xfg".parse::<Cpumask>(),
        Err(ParseCpumaskError::InvalidDigit('g'))
    );
    assert_eq!(
        Cpumask::from_hex("0x10", 4),
        Err(ParseCpumaskError::OutOfRange(BoundsError { index: 4, len: 4 }))
    );
}

#[test]
fn and_reports_non_empty() {
    let a = Cpumask::from_hex("0b", 8).unwrap();
    let b = Cpumask::from_hex("04", 8).unwrap();
    let mut dst = Cpumask::full(8);
    assert!(!dst.and(&a, &b));
    assert!(dst.is_empty());
    dst.or(&a, &b);
    assert_eq!(dst.weight(), 4);
    dst.xor(&a, &a);
    assert!(dst.is_empty());
    dst.copy_from(&a);
    assert!(dst.equal(&a));
}

#[test]
fn cpumask_ref_is_mutable_only_while_unique() {
    let mut mask = CpumaskRef::create(16);
    mask.get_mut().unwrap().set(3).unwrap();

    let shared = mask.acquire();
    assert_eq!(mask.refs(), 2);
    assert!(mask.get_mut().is_none());
    assert!(shared.test(3).unwrap());

    shared.release();
    assert_eq!(mask.refs(), 1);
    mask.get_mut().unwrap().clear(3).unwrap();
    assert!(mask.is_empty());
    mask.release();
}

proptest! {
    #[test]
    fn and_is_idempotent((a, _) in mask_pair()) {
        let mut dst = Cpumask::new(a.nr_cpus());
        dst.and(&a, &a);
        prop_assert_eq!(dst, a);
    }

    #[test]
    fn or_with_complement_is_full((a, _) in mask_pair()) {
        let mut dst = Cpumask::new(a.nr_cpus());
        dst.or(&a, &a.complement());
        prop_assert!(dst.is_full());
    }

    #[test]
    fn and_with_empty_is_empty((a, _) in mask_pair()) {
        let empty = Cpumask::new(a.nr_cpus());
        let mut dst = Cpumask::full(a.nr_cpus());
        prop_assert!(!dst.and(&a, &empty));
        prop_assert!(dst.is_empty());
    }

    #[test]
    fn subset_of_union((a, b) in mask_pair()) {
        let mut union = Cpumask::new(a.nr_cpus());
        union.or(&a, &b);
        prop_assert!(a.is_subset_of(&union));
        prop_assert!(b.is_subset_of(&union));
    }

    #[test]
    fn intersects_matches_and((a, b) in mask_pair()) {
        let mut dst = Cpumask::new(a.nr_cpus());
        let non_empty = dst.and(&a, &b);
        prop_assert_eq!(non_empty, a.intersects(&b));
        prop_assert_eq!(a.first_and(&b), dst.first());
    }

    #[test]
    fn weight_matches_iter((a, _) in mask_pair()) {
        prop_assert_eq!(a.weight(), a.iter().count());
        prop_assert_eq!(a.weight() + a.complement().weight(), a.nr_cpus());
    }

    #[test]
    fn display_parses_back((a, _) in mask_pair()) {
        let s = a.to_string();
        let (nr, hex) = s.split_once(':').unwrap();
        prop_assert_eq!(nr.parse::<usize>().unwrap(), a.nr_cpus());
        prop_assert_eq!(Cpumask::from_hex(hex, a.nr_cpus()).unwrap(), a);
    }
}
