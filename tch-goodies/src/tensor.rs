use crate::common::*;

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    fn has_nan(&self) -> bool;

    /// Split a `[N, K]` tensor into `K` column tensors in shape `[N, 1]`.
    fn f_unzip_columns(&self, num_columns: i64) -> Result<Vec<Tensor>>;

    fn f_sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let mut iter = tensors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| format_err!("the input iterator must not be empty"))?
            .borrow()
            .shallow_clone();
        let sum = iter.try_fold(first, |lhs, rhs| lhs.f_add(rhs.borrow()))?;
        Ok(sum)
    }
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn has_nan(&self) -> bool {
        bool::from(self.isnan().any())
    }

    fn f_unzip_columns(&self, num_columns: i64) -> Result<Vec<Tensor>> {
        let (_, cols) = self.size2()?;
        ensure!(
            cols == num_columns,
            "expect {} columns, but get {}",
            num_columns,
            cols
        );
        let columns: Vec<_> = (0..num_columns)
            .map(|index| self.i((.., index..(index + 1))))
            .collect();
        Ok(columns)
    }
}
