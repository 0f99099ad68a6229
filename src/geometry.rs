//! Convex polygons lying on the ground plane. Points are compared by their
//! X and Z coordinates; the height is ignored.

use na::{Vector2, Vector3};
use ordered_float::OrderedFloat;

use crate::types::Float;

fn ground_coords(p: &Vector3<Float>) -> Vector2<Float> {
    Vector2::new(p.x, p.z)
}

/// Sort the corners of a convex polygon by angle around their centroid, so
/// consecutive corners share an edge.
pub fn sort_convex_corners(corners: &mut [Vector3<Float>]) {
    if corners.is_empty() {
        return;
    }
    let centroid = corners
        .iter()
        .fold(Vector2::zeros(), |acc, c| acc + ground_coords(c))
        / corners.len() as Float;
    corners.sort_by_key(|c| {
        let d = ground_coords(c) - centroid;
        OrderedFloat(d.y.atan2(d.x))
    });
}

/// Whether `point` lies inside (or on the boundary of) the convex polygon
/// with `corners` sorted by `sort_convex_corners`.
pub fn convex_polygon_contains(point: &Vector3<Float>, corners: &[Vector3<Float>]) -> bool {
    if corners.len() < 3 {
        return false;
    }
    let p = ground_coords(point);
    let mut sign = 0.;
    for (i, corner) in corners.iter().enumerate() {
        let a = ground_coords(corner);
        let b = ground_coords(&corners[(i + 1) % corners.len()]);
        let edge = b - a;
        let to_point = p - a;
        let cross = edge.x * to_point.y - edge.y * to_point.x;
        if cross == 0. {
            continue;
        }
        if sign == 0. {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod geometry_tests {
    use na::vector;

    use super::*;

    fn unit_square_shuffled() -> Vec<Vector3<Float>> {
        vec![
            vector![1., 0., 1.],
            vector![0., 0., 0.],
            vector![0., 0., 1.],
            vector![1., 0., 0.],
        ]
    }

    #[test]
    fn sorted_corners_are_adjacent() {
        // Arrange
        let mut corners = unit_square_shuffled();

        // Act
        sort_convex_corners(&mut corners);

        // Assert
        for i in 0..corners.len() {
            let edge = corners[(i + 1) % corners.len()] - corners[i];
            assert_eq!(edge.norm(), 1., "corners {} and {} are not adjacent", i, i + 1);
        }
    }

    #[test]
    fn containment_ignores_height() {
        let mut corners = unit_square_shuffled();
        sort_convex_corners(&mut corners);

        assert!(convex_polygon_contains(&vector![0.5, 3., 0.5], &corners));
        assert!(convex_polygon_contains(&vector![0.2, -1., 0.9], &corners));
        assert!(convex_polygon_contains(&vector![1., 0., 0.5], &corners));
        assert!(!convex_polygon_contains(&vector![1.5, 0., 0.5], &corners));
        assert!(!convex_polygon_contains(&vector![0.5, 0., -0.01], &corners));
    }

    #[test]
    fn degenerate_polygons_contain_nothing() {
        let corners = vec![vector![0., 0., 0.], vector![1., 0., 1.]];
        assert!(!convex_polygon_contains(&vector![0.5, 0., 0.5], &corners));
    }
}
