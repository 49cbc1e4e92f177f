//! The numeric capability set a worker's transformer stack is built from
//! (§4.1, §9 Design Notes), plus the sharded linear layer types tensor
//! parallelism composes them with. A concrete backend (`rt-kernels-cpu`)
//! implements the `Kernels` trait; everything in this crate is backend-
//! agnostic shape and sharding bookkeeping.

pub mod kernels;
pub mod linear;
pub mod tensor;

pub use kernels::{AttnSpan, Kernels, TpGroup};
pub use linear::{ColumnParallelLinear, FusedParallelLinear, RowParallelLinear};
pub use tensor::Tensor;

#[cfg(test)]
mod tests {
    use super::*;
    use rt_common::RuntimeError;

    #[test]
    fn row_slice_rejects_out_of_bounds() {
        let t = Tensor::zeros(&[4, 3]);
        assert!(matches!(t.row_slice(2, 4), Err(RuntimeError::ShapeError(_))));
    }

    #[test]
    fn cat_rows_preserves_order() {
        let a = Tensor::from_vec(&[1, 2], vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(&[1, 2], vec![3.0, 4.0]).unwrap();
        let cat = Tensor::cat_rows(&[&a, &b]).unwrap();
        assert_eq!(cat.shape, vec![2, 2]);
        assert_eq!(cat.data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn column_parallel_shards_are_divisible() {
        let w = Tensor::zeros(&[6, 4]);
        let group = TpGroup::new(4);
        let err = ColumnParallelLinear::shard(&w, group, 0);
        assert!(err.is_err());
    }

    #[test]
    fn trivial_group_has_world_size_one() {
        assert!(TpGroup::new(1).is_trivial());
        assert!(TpGroup::new(0).is_trivial());
        assert!(!TpGroup::new(2).is_trivial());
    }
}
