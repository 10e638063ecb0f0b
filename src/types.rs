use std::sync::Arc;

use crate::errors::OperatorError;

/// Derivative multi-index of an external operator node.
///
/// Entry `i` records how many times the node has been differentiated with respect to
/// operand `i`. The original, user-declared node carries all zeros.
pub type MultiIndex = Vec<usize>;

/// Type alias for a JIT-compiled function that evaluates multiple expressions at once.
///
/// This represents a function that:
/// - Takes a slice of input values corresponding to variables in order
/// - Takes a mutable slice to store the results
/// - Evaluates all compiled expressions and writes results into the output slice
/// - Is both Send and Sync for thread safety
pub type CombinedJITFunction = Arc<dyn Fn(&[f64], &mut [f64]) + Send + Sync>;

/// Type alias for the callable that produces one derivative tensor of an external operator.
///
/// The callable receives the evaluated operands of its node, one flat array per operand in
/// declared operand order, laid out as `(#points, *operand_value_shape)`. It returns a flat
/// array of length `#points × value_size` of the derivative it implements, optionally together
/// with auxiliary data.
pub type Kernel = Arc<dyn Fn(&[&[f64]]) -> Result<KernelOutput, OperatorError> + Send + Sync>;

/// Output of a kernel call.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelOutput {
    /// Flat values of the derivative tensor at every quadrature point
    pub value: Vec<f64>,
    /// Auxiliary values computed alongside, e.g. the updated stress of a return mapping
    pub aux: Option<Vec<f64>>,
}

impl From<Vec<f64>> for KernelOutput {
    fn from(value: Vec<f64>) -> Self {
        Self { value, aux: None }
    }
}

impl From<(Vec<f64>, Vec<f64>)> for KernelOutput {
    fn from((value, aux): (Vec<f64>, Vec<f64>)) -> Self {
        Self {
            value,
            aux: Some(aux),
        }
    }
}

/// Wraps a closure into a [`Kernel`].
///
/// The closure may return anything convertible into a [`KernelOutput`]: a plain `Vec<f64>`,
/// or a `(value, aux)` pair.
pub fn kernel<F, O>(f: F) -> Kernel
where
    F: Fn(&[&[f64]]) -> Result<O, OperatorError> + Send + Sync + 'static,
    O: Into<KernelOutput>,
{
    Arc::new(move |operands: &[&[f64]]| f(operands).map(Into::into))
}

/// Number of scalar entries of a tensor with the given shape.
pub fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}
