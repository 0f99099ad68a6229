use std::{fmt, ops::Range};

use super::InclusionFlags;

/// A named, contiguous segment of the decision vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    GroupMasses,
    GroupComs,
    GroupInertias,
    GroupScales,
    MarkerOffset { marker: usize },
    Pose { trial: usize, t: usize },
    Velocity { trial: usize, t: usize },
    Acceleration { trial: usize, t: usize },
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::GroupMasses => write!(f, "group masses"),
            BlockKind::GroupComs => write!(f, "group COMs"),
            BlockKind::GroupInertias => write!(f, "group inertias"),
            BlockKind::GroupScales => write!(f, "group scales"),
            BlockKind::MarkerOffset { marker } => write!(f, "marker offset {}", marker),
            BlockKind::Pose { trial, t } => write!(f, "pose (trial {}, t {})", trial, t),
            BlockKind::Velocity { trial, t } => write!(f, "velocity (trial {}, t {})", trial, t),
            BlockKind::Acceleration { trial, t } => {
                write!(f, "acceleration (trial {}, t {})", trial, t)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub offset: usize,
    pub len: usize,
}

impl Block {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Sizes the layout is generated from.
#[derive(Clone, Debug)]
pub struct LayoutDims {
    pub num_groups: usize,
    pub num_markers: usize,
    pub num_dofs: usize,
    pub trial_lengths: Vec<usize>,
}

/// The decision vector schema.
///
/// Parameter blocks come first (masses, COMs, inertias, scales, marker
/// offsets), then for every trial of length T, for t in 0..T-2 the triple
/// (pose t, velocity t, acceleration t), followed by pose T-2, velocity T-2
/// and pose T-1. Blocks are contiguous and cover the whole vector.
#[derive(Clone, Debug)]
pub struct DecisionLayout {
    blocks: Vec<Block>,
    len: usize,
    poses: Vec<Vec<usize>>,
    velocities: Vec<Vec<usize>>,
    accelerations: Vec<Vec<usize>>,
    markers: Vec<usize>,
}

impl DecisionLayout {
    pub fn new(flags: &InclusionFlags, dims: &LayoutDims) -> Self {
        let mut layout = DecisionLayout {
            blocks: vec![],
            len: 0,
            poses: vec![],
            velocities: vec![],
            accelerations: vec![],
            markers: vec![],
        };

        let g = dims.num_groups;
        if flags.masses {
            layout.push(BlockKind::GroupMasses, g);
        }
        if flags.coms {
            layout.push(BlockKind::GroupComs, 3 * g);
        }
        if flags.inertias {
            layout.push(BlockKind::GroupInertias, 6 * g);
        }
        if flags.body_scales {
            layout.push(BlockKind::GroupScales, 3 * g);
        }
        if flags.marker_offsets {
            for marker in 0..dims.num_markers {
                let index = layout.push(BlockKind::MarkerOffset { marker }, 3);
                layout.markers.push(index);
            }
        }

        if flags.poses {
            let n = dims.num_dofs;
            for (trial, &T) in dims.trial_lengths.iter().enumerate() {
                assert!(T >= 3, "trial {} has {} timesteps, need at least 3", trial, T);
                let mut poses = Vec::with_capacity(T);
                let mut velocities = Vec::with_capacity(T - 1);
                let mut accelerations = Vec::with_capacity(T - 2);
                for t in 0..T - 2 {
                    poses.push(layout.push(BlockKind::Pose { trial, t }, n));
                    velocities.push(layout.push(BlockKind::Velocity { trial, t }, n));
                    accelerations.push(layout.push(BlockKind::Acceleration { trial, t }, n));
                }
                poses.push(layout.push(BlockKind::Pose { trial, t: T - 2 }, n));
                velocities.push(layout.push(BlockKind::Velocity { trial, t: T - 2 }, n));
                poses.push(layout.push(BlockKind::Pose { trial, t: T - 1 }, n));

                layout.poses.push(poses);
                layout.velocities.push(velocities);
                layout.accelerations.push(accelerations);
            }
        }

        layout
    }

    fn push(&mut self, kind: BlockKind, len: usize) -> usize {
        self.blocks.push(Block {
            kind,
            offset: self.len,
            len,
        });
        self.len += len;
        self.blocks.len() - 1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn parameter(&self, kind: BlockKind) -> Option<&Block> {
        self.blocks.iter().find(|b| b.kind == kind)
    }

    pub fn marker(&self, marker: usize) -> Option<&Block> {
        self.markers.get(marker).map(|&i| &self.blocks[i])
    }

    pub fn pose(&self, trial: usize, t: usize) -> Option<&Block> {
        Self::lookup(&self.blocks, &self.poses, trial, t)
    }

    pub fn velocity(&self, trial: usize, t: usize) -> Option<&Block> {
        Self::lookup(&self.blocks, &self.velocities, trial, t)
    }

    pub fn acceleration(&self, trial: usize, t: usize) -> Option<&Block> {
        Self::lookup(&self.blocks, &self.accelerations, trial, t)
    }

    fn lookup<'a>(
        blocks: &'a [Block],
        table: &[Vec<usize>],
        trial: usize,
        t: usize,
    ) -> Option<&'a Block> {
        table.get(trial).and_then(|ts| ts.get(t)).map(|&i| &blocks[i])
    }

    /// Offset of pose t of `trial`. Panics when poses are not in the layout.
    pub fn pose_offset(&self, trial: usize, t: usize) -> usize {
        self.blocks[self.poses[trial][t]].offset
    }

    pub fn velocity_offset(&self, trial: usize, t: usize) -> usize {
        self.blocks[self.velocities[trial][t]].offset
    }

    pub fn acceleration_offset(&self, trial: usize, t: usize) -> usize {
        self.blocks[self.accelerations[trial][t]].offset
    }

    /// The block containing decision variable `index`
    pub fn block_containing(&self, index: usize) -> Option<&Block> {
        let i = self.blocks.partition_point(|b| b.offset + b.len <= index);
        self.blocks.get(i).filter(|b| b.range().contains(&index))
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;

    fn dims() -> LayoutDims {
        LayoutDims {
            num_groups: 2,
            num_markers: 3,
            num_dofs: 4,
            trial_lengths: vec![3, 5],
        }
    }

    #[test]
    fn blocks_are_contiguous_and_cover_the_vector() {
        // Arrange
        let flags = InclusionFlags::default();

        // Act
        let layout = DecisionLayout::new(&flags, &dims());

        // Assert
        let mut cursor = 0;
        for block in layout.blocks() {
            assert_eq!(block.offset, cursor);
            cursor += block.len;
        }
        assert_eq!(cursor, layout.len());
        // 2 + 6 + 12 + 6 parameters, 9 marker, (3 + 2 + 1) + (5 + 4 + 3) trial blocks
        assert_eq!(layout.len(), 26 + 9 + 4 * (6 + 12));
    }

    #[test]
    fn trial_blocks_interleave_pose_velocity_acceleration() {
        let layout = DecisionLayout::new(&InclusionFlags::default(), &dims());

        let p0 = layout.pose(1, 0).unwrap().offset;
        assert_eq!(layout.velocity(1, 0).unwrap().offset, p0 + 4);
        assert_eq!(layout.acceleration(1, 0).unwrap().offset, p0 + 8);
        assert_eq!(layout.pose(1, 1).unwrap().offset, p0 + 12);

        // tail: pose T-2, velocity T-2, pose T-1
        let tail = layout.pose(1, 3).unwrap().offset;
        assert_eq!(layout.velocity(1, 3).unwrap().offset, tail + 4);
        assert_eq!(layout.pose(1, 4).unwrap().offset, tail + 8);
        assert!(layout.acceleration(1, 3).is_none());
        assert_eq!(layout.pose(1, 4).unwrap().offset + 4, layout.len());
    }

    #[test]
    fn excluded_groups_have_no_blocks() {
        let flags = InclusionFlags {
            coms: false,
            poses: false,
            marker_offsets: false,
            ..Default::default()
        };
        let layout = DecisionLayout::new(&flags, &dims());

        assert!(layout.parameter(BlockKind::GroupComs).is_none());
        assert!(layout.pose(0, 0).is_none());
        assert!(layout.marker(0).is_none());
        assert_eq!(layout.parameter(BlockKind::GroupScales).unwrap().offset, 2 + 12);
        assert_eq!(layout.len(), 2 + 12 + 6);
        assert_eq!(layout.block_containing(3).unwrap().kind, BlockKind::GroupInertias);
    }
}
