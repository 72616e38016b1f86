#[macro_export]
macro_rules! is_power_of_2 {
    ($x:expr) => {
        ($x) != 0 && ($x) & (($x) - 1) == 0
    };
}

/// Number of `unit` sized blocks needed to hold `x` bytes.
#[inline]
pub fn blocks_for(x: u32, unit: u32) -> u32 {
    debug_assert!(unit != 0);
    x / unit + if x % unit != 0 { 1 } else { 0 }
}

#[cfg(test)]
#[test]
fn test_is_power_of_2() {
    crate::tests_init();

    assert!(!is_power_of_2!(0));
    assert!(!is_power_of_2!(7));
    assert!(is_power_of_2!(8));
    assert!(!is_power_of_2!(63));
    assert!(is_power_of_2!(64));
    assert!(!is_power_of_2!(65));
    assert!(is_power_of_2!(128u8));
}

#[cfg(test)]
#[test]
fn test_blocks_for() {
    crate::tests_init();

    assert_eq!(blocks_for(0, 512), 0);
    assert_eq!(blocks_for(1, 512), 1);
    assert_eq!(blocks_for(512, 512), 1);
    assert_eq!(blocks_for(513, 512), 2);
    assert_eq!(blocks_for(7168, 512), 14);
}
