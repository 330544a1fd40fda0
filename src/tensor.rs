//! Minimal dense tensor type used for constant data.
//!
//! The export engine never executes kernels; it only needs to hold constant
//! payloads, evaluate foldable operators on them, and hand their raw bytes to
//! the format encoders. A simple row-major buffer covers all of that.

/// Dense row-major tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Create a tensor with the given shape and elements in row-major order.
    ///
    /// Panics if the element count does not match the shape.
    pub fn from_data(shape: &[usize], data: Vec<T>) -> Tensor<T> {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "element count does not match shape"
        );
        Tensor {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Create a 0-dimensional tensor holding a single value.
    pub fn from_scalar(value: T) -> Tensor<T> {
        Tensor {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// Create a 1-dimensional tensor from a list of values.
    pub fn from_vec(data: Vec<T>) -> Tensor<T> {
        Tensor {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the single element of a one-element tensor.
    pub fn item(&self) -> Option<&T> {
        match self.data.as_slice() {
            [item] => Some(item),
            _ => None,
        }
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Return a tensor with the same shape and `f` applied to every element.
    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> Tensor<U> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }

    /// Return this tensor's data with a new shape of equal element count.
    ///
    /// Panics if the element counts differ.
    pub fn reshaped(self, shape: Vec<usize>) -> Tensor<T> {
        assert_eq!(
            shape.iter().product::<usize>(),
            self.data.len(),
            "element count does not match new shape"
        );
        Tensor {
            shape,
            data: self.data,
        }
    }

    /// Return the row-major strides of this tensor.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![0; self.shape.len()];
        let mut stride = 1;
        for (i, size) in self.shape.iter().enumerate().rev() {
            strides[i] = stride;
            stride *= size;
        }
        strides
    }
}

#[cfg(test)]
mod tests {
    use super::Tensor;

    #[test]
    fn test_from_data() {
        let tensor = Tensor::from_data(&[2, 3], vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(tensor.shape(), &[2, 3]);
        assert_eq!(tensor.len(), 6);
        assert_eq!(tensor.item(), None);
    }

    #[test]
    #[should_panic(expected = "element count does not match shape")]
    fn test_from_data_wrong_len() {
        Tensor::from_data(&[2, 3], vec![1, 2]);
    }

    #[test]
    fn test_scalar() {
        let tensor = Tensor::from_scalar(5.0f32);
        assert_eq!(tensor.ndim(), 0);
        assert_eq!(tensor.item(), Some(&5.0));
    }

    #[test]
    fn test_strides() {
        let tensor = Tensor::from_data(&[2, 3, 4], (0..24).collect());
        assert_eq!(tensor.strides(), &[12, 4, 1]);
    }

    #[test]
    fn test_map_and_reshape() {
        let tensor = Tensor::from_vec(vec![1i64, 2, 3, 4]);
        let doubled = tensor.map(|x| x * 2);
        assert_eq!(doubled.data(), &[2, 4, 6, 8]);
        let square = doubled.reshaped(vec![2, 2]);
        assert_eq!(square.shape(), &[2, 2]);
    }
}
