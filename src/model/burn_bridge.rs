//! Conversions between loop tensors and `burn` tensors, for models built on burn.
//!
//! Loop tensors are channels-last (`N x H x W x C`); burn's convolution
//! modules expect channels-first, so the `_nchw` helpers permute on the way.

use burn::prelude::*;
use burn::tensor::TensorData;
use ndarray::{ArrayD, IxDyn};

use crate::error::ModelError;

/// Copy a rank-4 loop tensor onto `device`, keeping its `N x H x W x C` layout.
pub fn to_burn<B: Backend>(tensor: &super::Tensor, device: &B::Device) -> Result<Tensor<B, 4>, ModelError> {
    let dims: [usize; 4] = tensor
        .shape()
        .try_into()
        .map_err(|_| format!("expected a rank-4 tensor, got shape {:?}", tensor.shape()))?;
    let flat: Vec<f32> = tensor.iter().copied().collect();
    Ok(Tensor::<B, 1>::from_data(TensorData::from(flat.as_slice()), device)
        .reshape([dims[0] as i32, dims[1] as i32, dims[2] as i32, dims[3] as i32]))
}

/// Like [`to_burn`], permuted to `N x C x H x W`.
pub fn to_burn_nchw<B: Backend>(
    tensor: &super::Tensor,
    device: &B::Device,
) -> Result<Tensor<B, 4>, ModelError> {
    Ok(to_burn::<B>(tensor, device)?.permute([0, 3, 1, 2]))
}

/// Read a burn tensor of any rank back into a loop tensor.
pub fn from_burn<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<super::Tensor, ModelError> {
    let dims = tensor.dims();
    let values = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| format!("failed to read tensor data: {e:?}"))?;
    Ok(ArrayD::from_shape_vec(IxDyn(&dims), values)?)
}

/// Inverse of [`to_burn_nchw`].
pub fn from_burn_nchw<B: Backend>(tensor: Tensor<B, 4>) -> Result<super::Tensor, ModelError> {
    from_burn(tensor.permute([0, 2, 3, 1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn ramp(shape: &[usize]) -> crate::data::Tensor {
        let n: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_channels_last_roundtrip() {
        let device = Default::default();
        let tensor = ramp(&[2, 3, 4, 3]);
        let burn = to_burn::<TestBackend>(&tensor, &device).unwrap();
        assert_eq!(burn.dims(), [2, 3, 4, 3]);
        assert_eq!(from_burn(burn).unwrap(), tensor);
    }

    #[test]
    fn test_nchw_moves_channels_forward() {
        let device = Default::default();
        let tensor = ramp(&[1, 2, 2, 3]);
        let burn = to_burn_nchw::<TestBackend>(&tensor, &device).unwrap();
        assert_eq!(burn.dims(), [1, 3, 2, 2]);

        // channel 1 of pixel (1, 0) sits at flat NHWC offset (1*2 + 0)*3 + 1 = 7
        let values = burn.clone().into_data().to_vec::<f32>().unwrap();
        assert_eq!(values[4 + 2], 7.0);
        assert_eq!(from_burn_nchw(burn).unwrap(), tensor);
    }

    #[test]
    fn test_rejects_wrong_rank() {
        let device = Default::default();
        assert!(to_burn::<TestBackend>(&ramp(&[4, 4, 3]), &device).is_err());
    }
}
