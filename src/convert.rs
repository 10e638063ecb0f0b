//! Conversion of evalexpr syntax trees into scalar expression trees.
//!
//! The law formulas are parsed by evalexpr and then walked by [`build_ast`], which maps
//! operand components to indexed variables, substitutes named constants and rejects
//! everything the JIT cannot compile.

use std::collections::HashMap;

use evalexpr::{Node, Operator, Value};

use crate::errors::ConvertError;
use crate::expr::Expr;

fn unary(
    node: &Node,
    var_map: &HashMap<String, u32>,
    constants: &HashMap<String, f64>,
) -> Result<Box<Expr>, ConvertError> {
    match node.children() {
        [child] => Ok(Box::new(build_ast(child, var_map, constants)?)),
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{:?} with {} arguments",
            node.operator(),
            children.len()
        ))),
    }
}

fn binary(
    node: &Node,
    var_map: &HashMap<String, u32>,
    constants: &HashMap<String, f64>,
) -> Result<(Box<Expr>, Box<Expr>), ConvertError> {
    match node.children() {
        [left, right] => Ok((
            Box::new(build_ast(left, var_map, constants)?),
            Box::new(build_ast(right, var_map, constants)?),
        )),
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{:?} with {} operands",
            node.operator(),
            children.len()
        ))),
    }
}

fn fold<F>(
    node: &Node,
    var_map: &HashMap<String, u32>,
    constants: &HashMap<String, f64>,
    combine: F,
) -> Result<Expr, ConvertError>
where
    F: Fn(Box<Expr>, Box<Expr>) -> Expr,
{
    let children = node.children();
    let first = children
        .first()
        .ok_or_else(|| ConvertError::UnsupportedOperator(format!("{:?} without operands", node.operator())))?;
    children
        .iter()
        .skip(1)
        .try_fold(build_ast(first, var_map, constants)?, |acc, child| {
            Ok(combine(Box::new(acc), Box::new(build_ast(child, var_map, constants)?)))
        })
}

/// Reads a numeric exponent, allowing a leading minus sign and parentheses.
fn exponent(node: &Node) -> Option<Value> {
    match node.operator() {
        Operator::Const { value } => Some(value.clone()),
        Operator::RootNode => match node.children() {
            [child] => exponent(child),
            _ => None,
        },
        Operator::Neg => match node.children() {
            [child] => match exponent(child)? {
                Value::Int(i) => Some(Value::Int(-i)),
                Value::Float(f) => Some(Value::Float(-f)),
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

/// Converts an evalexpr syntax tree into a scalar expression.
///
/// # Arguments
/// * `node` - The evalexpr node to convert
/// * `var_map` - Variable names and their positions in the input array
/// * `constants` - Named constants substituted by value
///
/// # Supported syntax
/// * Arithmetic: +, -, *, / and unary minus
/// * Numeric literals and named constants
/// * Functions: abs, exp, ln (or log), sqrt, sin, cos
/// * Exponentiation `x^c` where `c` is a numeric literal, possibly negative
pub fn build_ast(
    node: &Node,
    var_map: &HashMap<String, u32>,
    constants: &HashMap<String, f64>,
) -> Result<Expr, ConvertError> {
    match node.operator() {
        Operator::RootNode => match node.children() {
            [child] => build_ast(child, var_map, constants),
            children => Err(ConvertError::RootNode(format!("{} children", children.len()))),
        },
        Operator::Add => fold(node, var_map, constants, Expr::Add),
        Operator::Mul => fold(node, var_map, constants, Expr::Mul),
        Operator::Sub => {
            let (l, r) = binary(node, var_map, constants)?;
            Ok(Expr::Sub(l, r))
        }
        Operator::Div => {
            let (l, r) = binary(node, var_map, constants)?;
            Ok(Expr::Div(l, r))
        }
        Operator::Neg => Ok(Expr::Neg(unary(node, var_map, constants)?)),
        Operator::Const { value } => match value {
            Value::Float(f) => Ok(Expr::Const(*f)),
            Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => {
            if let Some(index) = var_map.get(identifier.as_str()) {
                Ok(Expr::var(identifier, *index))
            } else if let Some(value) = constants.get(identifier.as_str()) {
                Ok(Expr::Const(*value))
            } else {
                Err(ConvertError::VariableNotFound(identifier.to_string()))
            }
        }
        Operator::FunctionIdentifier { identifier } => {
            let arg = unary(node, var_map, constants)?;
            match identifier.as_str() {
                "abs" => Ok(Expr::Abs(arg)),
                "exp" => Ok(Expr::Exp(arg)),
                "ln" | "log" => Ok(Expr::Ln(arg)),
                "sqrt" => Ok(Expr::Sqrt(arg)),
                "sin" => Ok(Expr::Sin(arg)),
                "cos" => Ok(Expr::Cos(arg)),
                other => Err(ConvertError::UnsupportedFunction(other.to_string())),
            }
        }
        Operator::Exp => {
            let [base, power] = node.children() else {
                return Err(ConvertError::ExpOperator(format!(
                    "expected base and exponent, got {} operands",
                    node.children().len()
                )));
            };
            let base = Box::new(build_ast(base, var_map, constants)?);
            match exponent(power) {
                Some(Value::Int(n)) => Ok(Expr::Pow(base, n)),
                Some(Value::Float(p)) => Ok(Expr::PowFloat(base, p)),
                _ => Err(ConvertError::ExpOperator(format!("{:?}", power.operator()))),
            }
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}
