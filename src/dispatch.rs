//! Resolution of external operator nodes to the kernels that compute them.
//!
//! A provider maps a derivative multi-index to the [`Kernel`] that computes that derivative,
//! or to nothing. Nothing is never treated as zero: [`resolve`] turns it into
//! `OperatorError::UnsupportedDerivative`.

use std::collections::HashMap;

use log::debug;

use crate::errors::OperatorError;
use crate::external::ExternalOperator;
use crate::types::{Kernel, MultiIndex};

/// A family-wide provider of kernels, keyed by derivative multi-index.
pub trait ExternalFunction: Send + Sync {
    /// The kernel computing the derivative `derivatives`, if implemented.
    fn kernel(&self, derivatives: &[usize]) -> Option<Kernel>;
}

impl<F> ExternalFunction for F
where
    F: Fn(&[usize]) -> Option<Kernel> + Send + Sync,
{
    fn kernel(&self, derivatives: &[usize]) -> Option<Kernel> {
        self(derivatives)
    }
}

/// Kernels registered for exact multi-indices.
#[derive(Clone, Default)]
pub struct KernelTable {
    kernels: HashMap<MultiIndex, Kernel>,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `kernel` for `derivatives`, replacing any previous registration.
    pub fn with(mut self, derivatives: &[usize], kernel: Kernel) -> Self {
        self.insert(derivatives, kernel);
        self
    }

    pub fn insert(&mut self, derivatives: &[usize], kernel: Kernel) {
        self.kernels.insert(derivatives.to_vec(), kernel);
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl std::fmt::Debug for KernelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.kernels.keys().collect();
        keys.sort();
        f.debug_struct("KernelTable").field("derivatives", &keys).finish()
    }
}

impl ExternalFunction for KernelTable {
    fn kernel(&self, derivatives: &[usize]) -> Option<Kernel> {
        self.kernels.get(derivatives).cloned()
    }
}

/// Looks up the kernel of `node`.
///
/// # Errors
/// Returns `OperatorError::MissingExternalFunction` if the family has no provider, and
/// `OperatorError::UnsupportedDerivative` if the provider has no kernel for the node's
/// multi-index.
pub fn resolve(node: &ExternalOperator) -> Result<Kernel, OperatorError> {
    let provider = node
        .external_function()
        .ok_or_else(|| OperatorError::MissingExternalFunction(node.name().to_string()))?;
    let kernel = provider
        .kernel(node.derivatives())
        .ok_or_else(|| OperatorError::UnsupportedDerivative {
            operator: node.name().to_string(),
            derivatives: node.derivatives().to_vec(),
        })?;
    debug!("resolved kernel for {} {:?}", node.name(), node.derivatives());
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::form::FormExpr;
    use crate::mesh::Mesh;
    use crate::space::QuadratureSpace;
    use crate::types::kernel;

    fn node() -> ExternalOperator {
        let mesh = Arc::new(Mesh::unit_square(1, 1));
        let space = QuadratureSpace::new(&mesh, 1, &[]).unwrap();
        ExternalOperator::new("N", vec![FormExpr::Scalar(2.0)], &space).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let n = node();
        n.set_external_function(
            KernelTable::new().with(&[1], kernel(|ops: &[&[f64]]| Ok(ops[0].to_vec()))),
        );
        assert!(resolve(&n.partial(0).unwrap()).is_ok());
        assert_eq!(
            resolve(&n).err(),
            Some(OperatorError::UnsupportedDerivative {
                operator: "N".to_string(),
                derivatives: vec![0],
            })
        );
    }

    #[test]
    fn test_missing_provider() {
        assert_eq!(
            resolve(&node()).err(),
            Some(OperatorError::MissingExternalFunction("N".to_string()))
        );
    }

    #[test]
    fn test_closure_provider() {
        let n = node();
        n.set_external_function(|d: &[usize]| -> Option<Kernel> {
            (d.iter().sum::<usize>() <= 2).then(|| kernel(|_: &[&[f64]]| Ok(vec![0.0; 2])))
        });
        assert!(resolve(&n.derivative(&[2]).unwrap()).is_ok());
        assert!(resolve(&n.derivative(&[3]).unwrap()).is_err());
    }
}
