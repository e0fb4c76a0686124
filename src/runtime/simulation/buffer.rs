//! Double-buffered entity storage.
//!
//! ```text
//! ┌──────────────── half 0 ────────────────┐┌──────────────── half 1 ────────────────┐
//! │ gen │ px py vx vy [extra..] │ px py ... ││ gen │ px py vx vy [extra..] │ px py ... │
//! └────────────────────────────────────────┘└────────────────────────────────────────┘
//! ```
//!
//! Generation `g` always lives in half `g & 1`. The producer reads half
//! `g & 1` and writes generation `g + 1` into the other half; publishing the
//! new generation number is the swap. Each half records the generation it
//! holds, so a reader always knows exactly which step it is looking at.
//!
//! Record count and stride are fixed at allocation.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Field offsets inside a record.
pub const POS_X: usize = 0;
pub const POS_Y: usize = 1;
pub const VEL_X: usize = 2;
pub const VEL_Y: usize = 3;

/// Smallest stride that holds position and velocity.
pub const MIN_STRIDE: usize = 4;

/// Simulation area. Positions are valid in `[0, width] x [0, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    #[inline]
    pub fn new(
        width: f32,
        height: f32,
    ) -> Self {
        Self { width, height }
    }

    /// Both extents finite and strictly positive.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }
}

/// Shape of the region: `entity_count` records of `stride` floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub entity_count: usize,
    pub stride: usize,
}

impl Layout {
    /// Number of floats in one half.
    #[inline]
    pub fn len(&self) -> usize {
        self.entity_count * self.stride
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }
}

/// Copy of one record's core fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityRecord {
    pub position_x: f32,
    pub position_y: f32,
    pub velocity_x: f32,
    pub velocity_y: f32,
}

impl EntityRecord {
    #[inline]
    fn from_fields(fields: &[f32]) -> Self {
        Self {
            position_x: fields[POS_X],
            position_y: fields[POS_Y],
            velocity_x: fields[VEL_X],
            velocity_y: fields[VEL_Y],
        }
    }
}

/// One half of the double buffer.
#[derive(Debug)]
pub struct Half {
    generation: u64,
    data: Box<[f32]>,
}

impl Half {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Two fixed-size halves shared by one producer and any number of readers.
#[derive(Debug)]
pub struct SimulationBuffer {
    layout: Layout,
    halves: [RwLock<Half>; 2],
}

impl SimulationBuffer {
    /// Allocate both halves, seeding generation 0 with `initial`.
    ///
    /// # Panics
    ///
    /// If `initial` does not hold exactly `layout.len()` floats.
    pub fn new(
        layout: Layout,
        initial: Vec<f32>,
    ) -> Self {
        assert_eq!(initial.len(), layout.len(), "initial state does not match layout");
        let back = initial.clone().into_boxed_slice();
        Self {
            layout,
            halves: [
                RwLock::new(Half {
                    generation: 0,
                    data: initial.into_boxed_slice(),
                }),
                RwLock::new(Half {
                    generation: 0,
                    data: back,
                }),
            ],
        }
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Index of the half holding `generation`.
    #[inline]
    pub fn half_index(generation: u64) -> usize {
        (generation & 1) as usize
    }

    /// Shared access to the half holding `generation`.
    #[inline]
    pub fn read(
        &self,
        generation: u64,
    ) -> RwLockReadGuard<'_, Half> {
        self.halves[Self::half_index(generation)].read()
    }

    /// Write `generation + 1` from `generation` using `step`.
    ///
    /// Callers must hold the producer role; there is exactly one writer.
    pub(crate) fn advance<F>(
        &self,
        generation: u64,
        step: F,
    ) -> u64
    where
        F: FnOnce(&[f32], &mut [f32]),
    {
        let next = generation + 1;
        let src: RwLockReadGuard<'_, Half> = self.read(generation);
        let mut dst: RwLockWriteGuard<'_, Half> = self.halves[Self::half_index(next)].write();
        step(&src.data, &mut dst.data);
        dst.generation = next;
        next
    }
}

/// Borrowed view of one complete generation.
///
/// Only valid inside the frame callback it was passed to; the half it
/// aliases may be rewritten once the callback returns.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    generation: u64,
    stride: usize,
    data: &'a [f32],
}

impl<'a> FrameView<'a> {
    #[inline]
    pub(crate) fn new(
        half: &'a Half,
        stride: usize,
    ) -> Self {
        Self {
            generation: half.generation,
            stride,
            data: &half.data,
        }
    }

    /// Generation this view belongs to.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of entities.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / self.stride
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// All fields of entity `index`, including any past the first four.
    #[inline]
    pub fn fields(
        &self,
        index: usize,
    ) -> Option<&'a [f32]> {
        let data: &'a [f32] = self.data;
        let start = index.checked_mul(self.stride)?;
        data.get(start..start.checked_add(self.stride)?)
    }

    /// Core fields of entity `index`.
    #[inline]
    pub fn record(
        &self,
        index: usize,
    ) -> Option<EntityRecord> {
        self.fields(index).map(EntityRecord::from_fields)
    }

    /// Core fields of every entity, in order.
    pub fn records(&self) -> impl Iterator<Item = EntityRecord> + 'a {
        let data: &'a [f32] = self.data;
        data.chunks_exact(self.stride).map(EntityRecord::from_fields)
    }

    /// The raw region.
    #[inline]
    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }
}

/// Advance one record: `position += velocity`, then flip the velocity
/// component on any axis whose new position left `[0, bound]`. Fields past
/// the first four are carried over unchanged.
#[inline]
pub fn integrate_record(
    src: &[f32],
    dst: &mut [f32],
    bounds: Bounds,
) {
    dst.copy_from_slice(src);

    let x = src[POS_X] + src[VEL_X];
    dst[POS_X] = x;
    if x < 0.0 || x > bounds.width {
        dst[VEL_X] = -src[VEL_X];
    }

    let y = src[POS_Y] + src[VEL_Y];
    dst[POS_Y] = y;
    if y < 0.0 || y > bounds.height {
        dst[VEL_Y] = -src[VEL_Y];
    }
}

/// Advance every record serially.
pub fn integrate(
    src: &[f32],
    dst: &mut [f32],
    stride: usize,
    bounds: Bounds,
) {
    for (s, d) in src.chunks_exact(stride).zip(dst.chunks_exact_mut(stride)) {
        integrate_record(s, d, bounds);
    }
}

/// Advance every record on the rayon pool. Produces the same values as
/// [`integrate`].
pub fn integrate_parallel(
    src: &[f32],
    dst: &mut [f32],
    stride: usize,
    bounds: Bounds,
) {
    dst.par_chunks_exact_mut(stride)
        .zip(src.par_chunks_exact(stride))
        .for_each(|(d, s)| integrate_record(s, d, bounds));
}
