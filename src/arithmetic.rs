use crate::atom_table::*;
use crate::machine::heap::*;
use crate::machine::machine_errors::*;
use crate::machine::machine_state::*;
use crate::types::*;

use dashu::integer::IBig;

use std::cmp::Ordering;

/// A materialized number: machine-word when it fits, arbitrary precision
/// otherwise. Every operation escapes to `Big` on overflow and
/// renormalizes to `Fixnum` when the result fits again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Number {
    Fixnum(i64),
    Big(IBig),
}

impl Number {
    pub(crate) fn from_big(n: IBig) -> Number {
        match i64::try_from(&n) {
            Ok(n) => Number::Fixnum(n),
            Err(_) => Number::Big(n),
        }
    }

    pub(crate) fn to_big(&self) -> IBig {
        match self {
            Number::Fixnum(n) => IBig::from(*n),
            Number::Big(n) => n.clone(),
        }
    }

    pub(crate) fn to_cell(&self, heap: &mut Heap) -> HeapCellValue {
        match self {
            Number::Fixnum(n) => HeapCellValue::Fixnum(*n),
            Number::Big(n) => heap.put_integer(n),
        }
    }

    pub(crate) fn is_zero(&self) -> bool {
        match self {
            Number::Fixnum(n) => *n == 0,
            Number::Big(n) => *n == IBig::ZERO,
        }
    }

    pub(crate) fn cmp(&self, other: &Number) -> Ordering {
        match (self, other) {
            (Number::Fixnum(n1), Number::Fixnum(n2)) => n1.cmp(n2),
            _ => self.to_big().cmp(&other.to_big()),
        }
    }
}

fn binop(
    n1: &Number,
    n2: &Number,
    fixnum_op: impl Fn(i64, i64) -> Option<i64>,
    big_op: impl Fn(&IBig, &IBig) -> IBig,
) -> Number {
    if let (Number::Fixnum(a), Number::Fixnum(b)) = (n1, n2) {
        if let Some(n) = fixnum_op(*a, *b) {
            return Number::Fixnum(n);
        }
    }

    Number::from_big(big_op(&n1.to_big(), &n2.to_big()))
}

pub(crate) fn add(n1: &Number, n2: &Number) -> Number {
    binop(n1, n2, i64::checked_add, |a, b| a + b)
}

pub(crate) fn sub(n1: &Number, n2: &Number) -> Number {
    binop(n1, n2, i64::checked_sub, |a, b| a - b)
}

pub(crate) fn mul(n1: &Number, n2: &Number) -> Number {
    binop(n1, n2, i64::checked_mul, |a, b| a * b)
}

pub(crate) fn neg(n: &Number) -> Number {
    match n {
        Number::Fixnum(a) => a
            .checked_neg()
            .map(Number::Fixnum)
            .unwrap_or_else(|| Number::from_big(-IBig::from(*a))),
        Number::Big(a) => Number::from_big(-a.clone()),
    }
}

pub(crate) fn abs(n: &Number) -> Number {
    if n.cmp(&Number::Fixnum(0)) == Ordering::Less {
        neg(n)
    } else {
        n.clone()
    }
}

pub(crate) fn idiv(n1: &Number, n2: &Number) -> Result<Number, MachineError> {
    if n2.is_zero() {
        return Err(MachineError::EvaluationError("zero_divisor"));
    }

    Ok(binop(n1, n2, i64::checked_div, |a, b| a / b))
}

/// Floor division, `div/2`.
pub(crate) fn floor_div(n1: &Number, n2: &Number) -> Result<Number, MachineError> {
    if n2.is_zero() {
        return Err(MachineError::EvaluationError("zero_divisor"));
    }

    let q = idiv(n1, n2)?;
    let r = rem(n1, n2)?;

    // adjust truncating division toward negative infinity.
    if !r.is_zero() && (r.cmp(&Number::Fixnum(0)) == Ordering::Less) != (n2.cmp(&Number::Fixnum(0)) == Ordering::Less)
    {
        Ok(sub(&q, &Number::Fixnum(1)))
    } else {
        Ok(q)
    }
}

pub(crate) fn rem(n1: &Number, n2: &Number) -> Result<Number, MachineError> {
    if n2.is_zero() {
        return Err(MachineError::EvaluationError("zero_divisor"));
    }

    Ok(binop(n1, n2, i64::checked_rem, |a, b| a % b))
}

pub(crate) fn modulus(n1: &Number, n2: &Number) -> Result<Number, MachineError> {
    let r = rem(n1, n2)?;

    if !r.is_zero() && (r.cmp(&Number::Fixnum(0)) == Ordering::Less) != (n2.cmp(&Number::Fixnum(0)) == Ordering::Less)
    {
        Ok(add(&r, n2))
    } else {
        Ok(r)
    }
}

pub(crate) fn shl(n1: &Number, n2: &Number) -> Result<Number, MachineError> {
    let shift = match n2 {
        Number::Fixnum(s) if *s >= 0 && *s <= u16::MAX as i64 => *s as usize,
        _ => {
            return Err(MachineError::EvaluationError("shift_out_of_range"));
        }
    };

    Ok(Number::from_big(n1.to_big() << shift))
}

pub(crate) fn shr(n1: &Number, n2: &Number) -> Result<Number, MachineError> {
    let shift = match n2 {
        Number::Fixnum(s) if *s >= 0 && *s <= u16::MAX as i64 => *s as usize,
        _ => {
            return Err(MachineError::EvaluationError("shift_out_of_range"));
        }
    };

    Ok(Number::from_big(n1.to_big() >> shift))
}

pub(crate) fn and_bits(n1: &Number, n2: &Number) -> Number {
    binop(n1, n2, |a, b| Some(a & b), |a, b| a & b)
}

pub(crate) fn or_bits(n1: &Number, n2: &Number) -> Number {
    binop(n1, n2, |a, b| Some(a | b), |a, b| a | b)
}

pub(crate) fn xor_bits(n1: &Number, n2: &Number) -> Number {
    binop(n1, n2, |a, b| Some(a ^ b), |a, b| a ^ b)
}

pub(crate) fn complement(n: &Number) -> Number {
    match n {
        Number::Fixnum(a) => Number::Fixnum(!a),
        Number::Big(a) => Number::from_big(-(a.clone()) - IBig::ONE),
    }
}

pub(crate) fn gcd(n1: &Number, n2: &Number) -> Number {
    let mut a = abs(n1).to_big();
    let mut b = abs(n2).to_big();

    while b != IBig::ZERO {
        let r = &a % &b;
        a = b;
        b = r;
    }

    Number::from_big(a)
}

/// Evaluates an arithmetic expression term. The expression grammar is
/// integers, variables bound to integers, and the evaluable functors of
/// the builtin table; anything else is a type error.
pub(crate) fn eval(machine_st: &MachineState, expr: HeapCellValue) -> Result<Number, MachineError> {
    let cell = machine_st.store(machine_st.deref(expr));

    match cell {
        HeapCellValue::Fixnum(n) => Ok(Number::Fixnum(n)),
        HeapCellValue::Big(h) => Ok(Number::Big(machine_st.heap.read_big(h))),
        HeapCellValue::Var(_) | HeapCellValue::StackVar(..) => {
            Err(MachineError::InstantiationError(atom!("is"), 2))
        }
        HeapCellValue::Str(s) => {
            let (name, arity) = match machine_st.heap[s] {
                HeapCellValue::Atom(name, arity) => (name, arity),
                _ => {
                    return Err(MachineError::TypeError(
                        ValidType::Evaluable,
                        "corrupt structure".to_string(),
                    ))
                }
            };

            let arg = |i: usize| machine_st.heap[s + i];

            match (name, arity) {
                (name, 2) if name == atom!("+") => {
                    Ok(add(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?))
                }
                (name, 2) if name == atom!("-") => {
                    Ok(sub(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?))
                }
                (name, 2) if name == atom!("*") => {
                    Ok(mul(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?))
                }
                (name, 2) if name == atom!("//") || name == atom!("/") => {
                    idiv(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?)
                }
                (name, 2) if name == atom!("div") => {
                    floor_div(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?)
                }
                (name, 2) if name == atom!("mod") => {
                    modulus(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?)
                }
                (name, 2) if name == atom!("rem") => {
                    rem(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?)
                }
                (name, 2) if name == atom!("<<") => {
                    shl(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?)
                }
                (name, 2) if name == atom!(">>") => {
                    shr(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?)
                }
                (name, 2) if name == atom!("/\\") => {
                    Ok(and_bits(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?))
                }
                (name, 2) if name == atom!("\\/") => {
                    Ok(or_bits(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?))
                }
                (name, 2) if name == atom!("xor") => {
                    Ok(xor_bits(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?))
                }
                (name, 2) if name == atom!("min") => {
                    let n1 = eval(machine_st, arg(1))?;
                    let n2 = eval(machine_st, arg(2))?;

                    Ok(if n1.cmp(&n2) == Ordering::Greater { n2 } else { n1 })
                }
                (name, 2) if name == atom!("max") => {
                    let n1 = eval(machine_st, arg(1))?;
                    let n2 = eval(machine_st, arg(2))?;

                    Ok(if n1.cmp(&n2) == Ordering::Less { n2 } else { n1 })
                }
                (name, 2) if name == atom!("gcd") => {
                    Ok(gcd(&eval(machine_st, arg(1))?, &eval(machine_st, arg(2))?))
                }
                (name, 1) if name == atom!("-") => Ok(neg(&eval(machine_st, arg(1))?)),
                (name, 1) if name == atom!("+") => eval(machine_st, arg(1)),
                (name, 1) if name == atom!("abs") => Ok(abs(&eval(machine_st, arg(1))?)),
                (name, 1) if name == atom!("sign") => {
                    let n = eval(machine_st, arg(1))?;

                    Ok(Number::Fixnum(match n.cmp(&Number::Fixnum(0)) {
                        Ordering::Less => -1,
                        Ordering::Equal => 0,
                        Ordering::Greater => 1,
                    }))
                }
                (name, 1) if name == atom!("\\") => Ok(complement(&eval(machine_st, arg(1))?)),
                _ => Err(MachineError::TypeError(
                    ValidType::Evaluable,
                    format!("unknown evaluable functor of arity {}", arity),
                )),
            }
        }
        _ => Err(MachineError::TypeError(
            ValidType::Evaluable,
            "non-numeric argument".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    #[test]
    fn fixnum_overflow_escapes_to_big() {
        let n1 = Number::Fixnum(i64::MAX);
        let n2 = Number::Fixnum(1);

        match add(&n1, &n2) {
            Number::Big(n) => {
                assert_eq!(n, IBig::from(i64::MAX) + IBig::ONE);
            }
            n => panic!("expected a big result, got {:?}", n),
        }
    }

    #[test]
    fn big_results_renormalize_to_fixnum() {
        let big = Number::Big(IBig::from_str("18446744073709551616").unwrap());

        match idiv(&big, &Number::Big(IBig::from_str("18446744073709551616").unwrap())) {
            Ok(Number::Fixnum(1)) => {}
            n => panic!("expected fixnum 1, got {:?}", n),
        }
    }

    #[test]
    fn floor_division_rounds_toward_negative_infinity() {
        assert_eq!(
            floor_div(&Number::Fixnum(-7), &Number::Fixnum(2)).unwrap(),
            Number::Fixnum(-4)
        );
        assert_eq!(
            modulus(&Number::Fixnum(-7), &Number::Fixnum(2)).unwrap(),
            Number::Fixnum(1)
        );
    }

    #[test]
    fn zero_divisor_is_an_evaluation_error() {
        assert_eq!(
            idiv(&Number::Fixnum(1), &Number::Fixnum(0)),
            Err(MachineError::EvaluationError("zero_divisor"))
        );
    }
}
