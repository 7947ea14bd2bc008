use glam::DVec3;

/// Axis-aligned bounding box.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bounds {
    pub min: DVec3,
    pub max: DVec3,
}

impl Bounds {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    pub fn mid(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn contains(&self, p: DVec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Bounds of a child step. Step bits: 0b001 = +x, 0b010 = +y,
    /// 0b100 = +z, matching the engine's sibling order. In 2D trees z is
    /// never split: every cell spans the full vertical extent and the
    /// tube ticks carve it up instead.
    pub fn child(&self, step: usize, is3d: bool) -> Bounds {
        let mut min = self.min;
        let mut max = self.max;
        let size = (max - min) * 0.5;

        if (step & 0b001) > 0 {
            min.x += size.x;
        } else {
            max.x -= size.x;
        }
        if (step & 0b010) > 0 {
            min.y += size.y;
        } else {
            max.y -= size.y;
        }
        if is3d {
            if (step & 0b100) > 0 {
                min.z += size.z;
            } else {
                max.z -= size.z;
            }
        }

        Bounds::new(min, max)
    }

    /// Child step containing `p`, by comparison against the midpoint.
    pub fn step_of(&self, p: DVec3, is3d: bool) -> usize {
        let mid = self.mid();
        let mut step = 0;

        if p.x >= mid.x {
            step |= 0b001;
        }
        if p.y >= mid.y {
            step |= 0b010;
        }
        if is3d && p.z >= mid.z {
            step |= 0b100;
        }

        step
    }

    /// Expand into the tightest containing cube whose side is a power of
    /// two, centered on the midpoint. Tree traversal and tick math assume
    /// cubic bounds.
    pub fn cubic(&self) -> Bounds {
        let extents = self.max - self.min;
        let side = extents.x.max(extents.y).max(extents.z);
        let side = if side <= 1.0 {
            1.0
        } else {
            2f64.powi(side.log2().ceil() as i32)
        };

        let half = DVec3::splat(side * 0.5);
        let mid = self.mid();
        Bounds::new(mid - half, mid + half)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_and_contains() {
        let b = Bounds::new(DVec3::ZERO, DVec3::splat(4.0));
        assert_eq!(b.mid(), DVec3::splat(2.0));
        assert!(b.contains(DVec3::new(0.0, 4.0, 2.0)));
        assert!(!b.contains(DVec3::new(-0.1, 1.0, 1.0)));
    }

    #[test]
    fn children_partition_in_sibling_order() {
        let b = Bounds::new(DVec3::ZERO, DVec3::splat(2.0));

        // Step 0 is the low corner; bit 0 steps +x first.
        assert_eq!(b.child(0, true), Bounds::new(DVec3::ZERO, DVec3::splat(1.0)));
        assert_eq!(
            b.child(1, true),
            Bounds::new(DVec3::new(1.0, 0.0, 0.0), DVec3::new(2.0, 1.0, 1.0))
        );
        assert_eq!(
            b.child(2, true),
            Bounds::new(DVec3::new(0.0, 1.0, 0.0), DVec3::new(1.0, 2.0, 1.0))
        );
        assert_eq!(
            b.child(4, true),
            Bounds::new(DVec3::new(0.0, 0.0, 1.0), DVec3::new(1.0, 1.0, 2.0))
        );
    }

    #[test]
    fn flat_children_keep_the_full_vertical_extent() {
        let b = Bounds::new(DVec3::ZERO, DVec3::splat(2.0));

        let child = b.child(3, false);
        assert_eq!(child.min, DVec3::new(1.0, 1.0, 0.0));
        assert_eq!(child.max, DVec3::new(2.0, 2.0, 2.0));
    }

    #[test]
    fn step_of_matches_child() {
        let b = Bounds::new(DVec3::ZERO, DVec3::splat(8.0));
        for step in 0..8 {
            let child = b.child(step, true);
            assert_eq!(b.step_of(child.mid(), true), step);
        }
        for step in 0..4 {
            let child = b.child(step, false);
            assert_eq!(b.step_of(child.mid(), false), step);
        }
    }

    #[test]
    fn cubic_expands_to_power_of_two() {
        let b = Bounds::new(DVec3::ZERO, DVec3::new(5.0, 3.0, 1.0));
        let c = b.cubic();

        let extents = c.max - c.min;
        assert_eq!(extents.x, 8.0);
        assert_eq!(extents.y, 8.0);
        assert_eq!(extents.z, 8.0);
        assert_eq!(c.mid(), b.mid());
        assert!(c.contains(b.min) && c.contains(b.max));
    }

    #[test]
    fn intersects_is_inclusive() {
        let a = Bounds::new(DVec3::ZERO, DVec3::splat(1.0));
        let b = Bounds::new(DVec3::splat(1.0), DVec3::splat(2.0));
        let c = Bounds::new(DVec3::splat(1.5), DVec3::splat(2.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }
}
