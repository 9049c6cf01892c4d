// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod prependable;
mod view;

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    prependable::Prependable,
    view::{
        VectorisedView,
        View,
    },
};
