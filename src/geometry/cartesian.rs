//! Containment and reference mapping for axis-aligned box cells.
//!
//! Boundary tie-break: along every axis a cell owns the half-open interval
//! `[lo, hi)`, and additionally its upper end when that end lies on the upper
//! boundary of the whole domain. With cells tiling the domain this assigns
//! every domain point to exactly one cell.

use super::Aabb;

/// Whether `p` belongs to `cell` under the half-open tie-break.
pub fn box_contains<const D: usize>(cell: &Aabb<D>, domain: &Aabb<D>, p: &[f64; D]) -> bool {
    (0..D).all(|k| {
        let x = p[k];
        if x < cell.lo[k] {
            return false;
        }
        if x < cell.hi[k] {
            return true;
        }
        x == cell.hi[k] && cell.hi[k] >= domain.hi[k]
    })
}

/// Affine map of `p` onto the unit reference box of `cell`.
pub fn box_to_reference<const D: usize>(cell: &Aabb<D>, p: &[f64; D]) -> [f64; D] {
    let mut xi = [0.0; D];
    for k in 0..D {
        xi[k] = (p[k] - cell.lo[k]) / cell.extent(k);
    }
    xi
}

/// First `D` coordinates of `p` when `p` lies in the hyperplane
/// `x_k = 0` for every `k >= D`, the plane a `D`-dimensional mesh occupies
/// in `S`-dimensional space. `None` off that plane.
pub fn project_to_plane<const D: usize, const S: usize>(p: &[f64; S]) -> Option<[f64; D]> {
    if D > S || p[D.min(S)..].iter().any(|&x| x != 0.0) {
        return None;
    }
    Some(std::array::from_fn(|k| p[k]))
}

/// Pad reference coordinates of a `D`-dimensional cell with zeros up to `S`.
pub fn embed<const D: usize, const S: usize>(xi: &[f64; D]) -> [f64; S] {
    std::array::from_fn(|k| if k < D { xi[k] } else { 0.0 })
}

/// Inverse of [`box_to_reference`].
pub fn box_from_reference<const D: usize>(cell: &Aabb<D>, xi: &[f64; D]) -> [f64; D] {
    let mut p = [0.0; D];
    for k in 0..D {
        p[k] = cell.lo[k] + xi[k] * cell.extent(k);
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_face_belongs_to_upper_cell() {
        let domain = Aabb::unit();
        let left = Aabb::new([0.0, 0.0], [0.5, 1.0]);
        let right = Aabb::new([0.5, 0.0], [1.0, 1.0]);
        let p = [0.5, 0.3];
        assert!(!box_contains(&left, &domain, &p));
        assert!(box_contains(&right, &domain, &p));
    }

    #[test]
    fn domain_upper_corner_is_owned() {
        let domain = Aabb::unit();
        let corner = Aabb::new([0.5, 0.5], [1.0, 1.0]);
        assert!(box_contains(&corner, &domain, &[1.0, 1.0]));
        assert!(!box_contains(&corner, &domain, &[1.0, 1.0 + 1e-12]));
    }

    #[test]
    fn plane_projection_drops_zero_axes() {
        assert_eq!(project_to_plane::<2, 3>(&[0.25, 0.5, 0.0]), Some([0.25, 0.5]));
        assert_eq!(project_to_plane::<2, 3>(&[0.25, 0.5, 1e-9]), None);
        assert_eq!(project_to_plane::<2, 2>(&[0.25, 0.5]), Some([0.25, 0.5]));
        assert_eq!(embed::<2, 3>(&[0.5, 0.75]), [0.5, 0.75, 0.0]);
    }

    #[test]
    fn reference_map_is_affine() {
        let cell = Aabb::new([0.25, 0.5], [0.5, 1.0]);
        let xi = box_to_reference(&cell, &[0.3125, 0.75]);
        assert_eq!(xi, [0.25, 0.5]);
        assert_eq!(box_from_reference(&cell, &xi), [0.3125, 0.75]);
    }
}
