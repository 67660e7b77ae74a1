pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use serde::{Deserialize, Serialize};
pub use strum::AsRefStr;
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use tch_goodies::TensorExt;
