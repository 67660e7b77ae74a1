pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use getset::Getters;
pub use itertools::{izip, Itertools as _};
pub use log::{debug, warn};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    convert::{TryFrom, TryInto},
    num::NonZeroUsize,
    ops::Add,
    path::Path,
};
pub use tch::{Device, IndexOp, Kind, Tensor};
pub use tch_goodies::{BoxEncoder, CxCyWHTensor, TLBRTensor, TensorExt as _};
pub use tch_tensor_like::TensorLike;
