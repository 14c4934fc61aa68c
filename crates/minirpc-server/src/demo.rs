//! Demo `Calc` service registered by the binary.

use minirpc_core::{Registry, Result, Service};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Operands for the `Calc` methods (`{"A": .., "B": ..}` on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Operands {
    pub a: i64,
    pub b: i64,
}

/// Integer calculator: `Add`, `Mul`, `Div`.
pub fn calc_service() -> Result<Service> {
    Service::builder("Calc")
        .method("Add", |args: &Operands, reply: &mut i64| {
            *reply = args.a.checked_add(args.b).ok_or("integer overflow")?;
            Ok::<_, &str>(())
        })
        .method("Mul", |args: &Operands, reply: &mut i64| {
            *reply = args.a.checked_mul(args.b).ok_or("integer overflow")?;
            Ok::<_, &str>(())
        })
        .method("Div", |args: &Operands, reply: &mut i64| {
            if args.b == 0 {
                return Err("divide by zero");
            }
            *reply = args.a.checked_div(args.b).ok_or("integer overflow")?;
            Ok(())
        })
        .build()
}

/// A fresh registry holding the demo services.
pub fn demo_registry() -> Result<Arc<Registry>> {
    let registry = Registry::new();
    registry.register(calc_service()?)?;
    Ok(Arc::new(registry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operands_use_pascal_case() {
        let operands: Operands = serde_json::from_str(r#"{"A": 2, "B": 3}"#).unwrap();
        assert_eq!(operands, Operands { a: 2, b: 3 });
    }

    #[test]
    fn test_calc_methods() {
        let registry = demo_registry().unwrap();
        let cases = [("Calc.Add", 7), ("Calc.Mul", 12), ("Calc.Div", 1)];
        for (name, expected) in cases {
            let (_, method) = registry.lookup(name).unwrap();
            let mut reply = 0i64;
            method.call(&Operands { a: 4, b: 3 }, &mut reply).unwrap();
            assert_eq!(reply, expected, "{}", name);
        }
    }

    #[test]
    fn test_overflow_is_an_error() {
        let registry = demo_registry().unwrap();
        let (_, add) = registry.lookup("Calc.Add").unwrap();
        let mut reply = 0i64;
        let err = add
            .call(&Operands { a: i64::MAX, b: 1 }, &mut reply)
            .unwrap_err();
        assert!(err.to_string().contains("integer overflow"));
        assert_eq!(add.num_calls(), 0);
    }
}
