/// Dense f32 tensor: row-major shape, contiguous buffer.
///
/// `owned` distinguishes a tensor that allocated its own buffer from one
/// borrowed out of a session's workspace pool; the distinction is informational
/// only (both variants store a `Vec<f32>` here — true zero-copy pool borrowing
/// is modeled in `session::Workspace`, which hands out `&mut [f32]` slices
/// directly rather than constructing a `Tensor` per call).
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    owned: bool,
}

impl Tensor {
    /// Build a tensor from a shape and buffer. Panics (debug-checked) if
    /// `product(shape) != data.len()`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "tensor shape {:?} does not match buffer length {}",
            shape,
            data.len()
        );
        Self {
            shape,
            data,
            owned: true,
        }
    }

    /// Zero-filled tensor of the given shape.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self::new(shape, vec![0.0; len])
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn mark_borrowed(&mut self) {
        self.owned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_matches_shape_product() {
        let t = Tensor::zeros(vec![2, 3, 4]);
        assert_eq!(t.len(), 24);
        assert_eq!(t.shape(), &[2, 3, 4]);
    }

    #[test]
    #[should_panic]
    fn new_panics_on_shape_mismatch() {
        Tensor::new(vec![2, 2], vec![0.0; 3]);
    }
}
