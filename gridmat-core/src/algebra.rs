//! Index algebra for block-cyclic axis distributions.
//!
//! A distributed axis of length `n` is partitioned round-robin over `stride`
//! coordinates, with the coordinate `align` owning global index 0. Every
//! formula below is pure; the communication layer never recomputes ownership
//! in any other way.

/// Smallest global index owned by the process at `coord`.
#[inline]
pub fn shift(coord: u64, align: u64, stride: u64) -> u64 {
    debug_assert!(stride > 0 && coord < stride);
    (coord + stride - align % stride) % stride
}

/// Number of global indices in `0..n` owned by a process with the given
/// shift, i.e. `ceil((n - shift) / stride)` clipped to zero.
#[inline]
pub fn local_length(n: u64, shift: u64, stride: u64) -> u64 {
    debug_assert!(stride > 0);
    if n > shift {
        (n - shift + stride - 1) / stride
    } else {
        0
    }
}

/// Coordinate owning global index `i`.
#[inline]
pub fn owner(i: u64, align: u64, stride: u64) -> u64 {
    debug_assert!(stride > 0);
    (align + i) % stride
}

/// Local index of global index `i`, or `None` if `i` is not owned by the
/// process with the given shift.
#[inline]
pub fn local_index(i: u64, shift: u64, stride: u64) -> Option<u64> {
    if i >= shift && (i - shift) % stride == 0 {
        Some((i - shift) / stride)
    } else {
        None
    }
}

/// Global index stored at local index `iloc`.
#[inline]
pub fn global_index(iloc: u64, shift: u64, stride: u64) -> u64 {
    shift + iloc * stride
}

pub fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

pub fn lcm(a: u64, b: u64) -> u64 {
    debug_assert!(a > 0 && b > 0);
    a / gcd(a, b) * b
}

/// Extended Euclid: returns `(g, x, y)` with `a*x + b*y == g == gcd(a, b)`.
pub fn egcd(a: i64, b: i64) -> (i64, i64, i64) {
    if b == 0 {
        (a, 1, 0)
    } else {
        let (g, x, y) = egcd(b, a % b);
        (g, y, x - (a / b) * y)
    }
}

/// Smallest non-negative solution of `x = r1 (mod m1)` and `x = r2 (mod m2)`,
/// or `None` when the congruences are inconsistent. The solution is unique
/// modulo `lcm(m1, m2)`.
pub fn crt2(r1: u64, m1: u64, r2: u64, m2: u64) -> Option<u64> {
    debug_assert!(m1 > 0 && m2 > 0 && r1 < m1 && r2 < m2);
    let (g, x, _) = egcd(m1 as i64, m2 as i64);
    let g = g as u64;

    let diff = (r2 + m2 * m1 - r1) % m2; // (r2 - r1) mod m2, kept non-negative
    if diff % g != 0 {
        return None;
    }

    let l = lcm(m1, m2);
    let step = diff / g;
    let x = x.rem_euclid((m2 / g) as i64) as u64;
    Some((r1 + m1 * ((step * x) % (m2 / g))) % l)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_boundaries() {
        // stride k, alignment a: owner of i is (a + i) mod k.
        for &(k, a) in &[(4u64, 0u64), (4, 1), (4, 3), (3, 2), (1, 0)] {
            for &i in &[0u64, k - 1, k, 117] {
                let c = owner(i, a, k);
                let s = shift(c, a, k);
                assert_eq!(local_index(i, s, k).map(|l| global_index(l, s, k)), Some(i));
            }
        }
    }

    #[test]
    fn test_shift_of_alignment_owner() {
        assert_eq!(shift(2, 2, 4), 0);
        assert_eq!(shift(0, 2, 4), 2);
        assert_eq!(shift(3, 2, 4), 1);
    }

    #[test]
    fn test_local_length_conservation() {
        for &n in &[0u64, 1, 5, 16, 117] {
            for &k in &[1u64, 2, 3, 4, 7] {
                for a in 0..k {
                    let total: u64 = (0..k).map(|c| local_length(n, shift(c, a, k), k)).sum();
                    assert_eq!(total, n, "n={} k={} a={}", n, k, a);
                }
            }
        }
    }

    #[test]
    fn test_ownership_exclusive() {
        let (n, k, a) = (23u64, 5u64, 3u64);
        for i in 0..n {
            let owners = (0..k)
                .filter(|&c| local_index(i, shift(c, a, k), k).is_some())
                .count();
            assert_eq!(owners, 1);
        }
    }

    #[test]
    fn test_egcd() {
        for &(a, b) in &[(12i64, 8i64), (35, 14), (1, 1), (17, 5), (6, 9)] {
            let (g, x, y) = egcd(a, b);
            assert_eq!(a * x + b * y, g);
            assert_eq!(g as u64, gcd(a as u64, b as u64));
        }
    }

    #[test]
    fn test_crt2() {
        assert_eq!(crt2(2, 3, 3, 5), Some(8));
        assert_eq!(crt2(0, 2, 1, 4), None);
        assert_eq!(crt2(1, 2, 3, 4), Some(3));
        assert_eq!(crt2(0, 1, 2, 7), Some(2));

        // Brute-force cross-check on non-coprime moduli.
        for m1 in 1..7u64 {
            for m2 in 1..7u64 {
                for r1 in 0..m1 {
                    for r2 in 0..m2 {
                        let expected = (0..lcm(m1, m2)).find(|x| x % m1 == r1 && x % m2 == r2);
                        assert_eq!(crt2(r1, m1, r2, m2), expected);
                    }
                }
            }
        }
    }
}
