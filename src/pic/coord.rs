//! Cell coordinates derived from continuous particle positions.

/// Integer cell coordinate in `D` dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Coord<const D: usize>(pub [i32; D]);

impl<const D: usize> Coord<D> {
    /// Base cell of the quadratic interpolation stencil around `position`:
    /// `floor(position * inv_dx - 0.5) + 1` per axis.
    ///
    /// Axes beyond the `i32` range saturate, so far-away positions land
    /// outside any domain instead of wrapping into it. Non-finite axes map to
    /// an arbitrary cell; use [`try_from_position`](Self::try_from_position)
    /// for unchecked input.
    #[inline]
    pub fn from_position(position: [f32; D], inv_dx: f32) -> Self {
        let mut out = [0i32; D];
        for (dst, &p) in out.iter_mut().zip(position.iter()) {
            *dst = ((p * inv_dx - 0.5).floor() as i32).saturating_add(1);
        }
        Coord(out)
    }

    /// Like [`from_position`](Self::from_position), `None` when any axis is
    /// NaN or infinite.
    #[inline]
    pub fn try_from_position(position: [f32; D], inv_dx: f32) -> Option<Self> {
        position
            .iter()
            .all(|p| p.is_finite())
            .then(|| Self::from_position(position, inv_dx))
    }

    #[inline]
    pub fn axes(&self) -> &[i32; D] {
        &self.0
    }
}

impl<const D: usize> From<[i32; D]> for Coord<D> {
    fn from(value: [i32; D]) -> Self {
        Coord(value)
    }
}
