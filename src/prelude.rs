// SPDX-License-Identifier: MPL-2.0

pub(crate) use crate::{
    error::{Errno::*, Error},
    layers::bio::{BlockId, Lbn, Pbn, BLOCK_SIZE},
    os::{Arc, Box, String, ToString, Vec, Weak},
    return_errno, return_errno_with_msg,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

pub(crate) use core::fmt::{self, Debug};

pub(crate) use log::{debug, error, info, trace, warn};
