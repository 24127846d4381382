#![forbid(unsafe_code)]

//! Typed views over the string params of control-flow equations.

use fj_core::{Equation, Primitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ParamError;

/// Which intermediates of a scan body are saved for the backward pass;
/// everything else is recomputed from saved values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointPolicy {
    #[default]
    SaveEverything,
    SaveNothing,
    SaveOnly(Vec<Primitive>),
}

impl CheckpointPolicy {
    /// Whether the output of `primitive` may be stored as a residual.
    /// Control-flow equations are never recomputed.
    #[must_use]
    pub fn saveable(&self, primitive: Primitive) -> bool {
        if primitive.is_control_flow() {
            return true;
        }
        match self {
            Self::SaveEverything => true,
            Self::SaveNothing => false,
            Self::SaveOnly(prims) => prims.contains(&primitive),
        }
    }

    #[must_use]
    pub fn to_param(&self) -> String {
        match self {
            Self::SaveEverything => "everything".to_owned(),
            Self::SaveNothing => "nothing".to_owned(),
            Self::SaveOnly(prims) => {
                let names: Vec<&str> = prims.iter().map(|p| p.as_str()).collect();
                format!("only:{}", names.join(","))
            }
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ParamError> {
        match raw {
            "everything" => Ok(Self::SaveEverything),
            "nothing" => Ok(Self::SaveNothing),
            _ => {
                let Some(list) = raw.strip_prefix("only:") else {
                    return Err(ParamError {
                        primitive: Primitive::Scan,
                        detail: format!("unknown checkpoint policy '{raw}'"),
                    });
                };
                let prims = list
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(|name| {
                        Primitive::from_name(name).ok_or_else(|| ParamError {
                            primitive: Primitive::Scan,
                            detail: format!("unknown primitive '{name}' in checkpoint policy"),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::SaveOnly(prims))
            }
        }
    }
}

fn required<'a>(eqn: &'a Equation, key: &str) -> Result<&'a str, ParamError> {
    eqn.param(key).ok_or_else(|| ParamError {
        primitive: eqn.primitive,
        detail: format!("missing required param '{key}'"),
    })
}

fn usize_param(eqn: &Equation, key: &str) -> Result<usize, ParamError> {
    let raw = required(eqn, key)?;
    raw.parse().map_err(|_| ParamError {
        primitive: eqn.primitive,
        detail: format!("param '{key}' is not a non-negative integer: '{raw}'"),
    })
}

fn bool_param(eqn: &Equation, key: &str) -> Result<bool, ParamError> {
    match required(eqn, key)? {
        "true" => Ok(true),
        "false" => Ok(false),
        raw => Err(ParamError {
            primitive: eqn.primitive,
            detail: format!("param '{key}' is not a boolean: '{raw}'"),
        }),
    }
}

/// `while` inputs are `cond_consts ++ body_consts ++ carry`; sub-graphs are
/// `[cond, body]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhileParams {
    pub cond_nconsts: usize,
    pub body_nconsts: usize,
}

impl WhileParams {
    pub fn from_eqn(eqn: &Equation) -> Result<Self, ParamError> {
        let params = Self {
            cond_nconsts: usize_param(eqn, "cond_nconsts")?,
            body_nconsts: usize_param(eqn, "body_nconsts")?,
        };
        if eqn.sub_jaxprs.len() != 2 {
            return Err(ParamError {
                primitive: eqn.primitive,
                detail: format!("expected 2 sub-graphs, got {}", eqn.sub_jaxprs.len()),
            });
        }
        if eqn.inputs.len() < params.cond_nconsts + params.body_nconsts {
            return Err(ParamError {
                primitive: eqn.primitive,
                detail: "fewer inputs than declared constants".to_owned(),
            });
        }
        Ok(params)
    }

    #[must_use]
    pub fn to_params(self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cond_nconsts".to_owned(), self.cond_nconsts.to_string()),
            ("body_nconsts".to_owned(), self.body_nconsts.to_string()),
        ])
    }
}

/// `scan` inputs are `consts ++ carry ++ xs`, outputs `carry ++ ys`; the
/// single sub-graph is the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParams {
    pub num_consts: usize,
    pub num_carry: usize,
    pub length: usize,
    pub reverse: bool,
    pub unroll: usize,
    pub linear: Vec<bool>,
    pub checkpoint: CheckpointPolicy,
}

impl ScanParams {
    pub fn from_eqn(eqn: &Equation) -> Result<Self, ParamError> {
        let linear = match required(eqn, "linear")? {
            "" => Vec::new(),
            raw => raw.split(',').map(|flag| flag == "1").collect(),
        };
        let params = Self {
            num_consts: usize_param(eqn, "num_consts")?,
            num_carry: usize_param(eqn, "num_carry")?,
            length: usize_param(eqn, "length")?,
            reverse: bool_param(eqn, "reverse")?,
            unroll: usize_param(eqn, "unroll")?.max(1),
            linear,
            checkpoint: CheckpointPolicy::parse(required(eqn, "checkpoint")?)?,
        };
        if eqn.sub_jaxprs.len() != 1 {
            return Err(ParamError {
                primitive: eqn.primitive,
                detail: format!("expected 1 sub-graph, got {}", eqn.sub_jaxprs.len()),
            });
        }
        if eqn.inputs.len() < params.num_consts + params.num_carry
            || params.linear.len() != eqn.inputs.len()
        {
            return Err(ParamError {
                primitive: eqn.primitive,
                detail: format!(
                    "{} inputs do not fit num_consts={} num_carry={} linear={}",
                    eqn.inputs.len(),
                    params.num_consts,
                    params.num_carry,
                    params.linear.len()
                ),
            });
        }
        Ok(params)
    }

    #[must_use]
    pub fn num_xs(&self) -> usize {
        self.linear.len() - self.num_consts - self.num_carry
    }

    #[must_use]
    pub fn to_params(&self) -> BTreeMap<String, String> {
        let linear: Vec<&str> = self
            .linear
            .iter()
            .map(|&flag| if flag { "1" } else { "0" })
            .collect();
        BTreeMap::from([
            ("num_consts".to_owned(), self.num_consts.to_string()),
            ("num_carry".to_owned(), self.num_carry.to_string()),
            ("length".to_owned(), self.length.to_string()),
            ("reverse".to_owned(), self.reverse.to_string()),
            ("unroll".to_owned(), self.unroll.to_string()),
            ("linear".to_owned(), linear.join(",")),
            ("checkpoint".to_owned(), self.checkpoint.to_param()),
        ])
    }
}
