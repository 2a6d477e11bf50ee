// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The `LocalStorage` type for storing per-member round data of a session.
//!
//! [`LocalStorage`] stores values under a [`TypeTag`] and the [`MemberId`]
//! they were received from (or computed for).

use tracing::error;

use crate::{
    errors::{InternalError, Result},
    protocol::MemberId,
};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

/// A type implementing `TypeTag` can be used to store and retrieve
/// values of type `<T as TypeTag>::Value`.
pub(crate) trait TypeTag: 'static {
    type Value: Send + Sync;
}

pub(crate) mod storage {
    use super::TypeTag;
    use std::collections::HashSet;

    pub(crate) struct MessageQueue;
    impl TypeTag for MessageQueue {
        type Value = crate::message_queue::MessageQueue;
    }

    pub(crate) struct ProgressStore;
    impl TypeTag for ProgressStore {
        type Value = HashSet<String>;
    }
}

/// A type for storing values local to a protocol session.
#[derive(Debug, Default)]
pub(crate) struct LocalStorage {
    storage: HashMap<(MemberId, TypeId), Box<dyn Any + Send + Sync>>,
}

impl LocalStorage {
    /// Stores `value` via a [`TypeTag`] and [`MemberId`] tuple.
    pub(crate) fn store<T: TypeTag>(&mut self, member: &MemberId, value: T::Value) {
        let _ = self
            .storage
            .insert((member.clone(), TypeId::of::<T>()), Box::new(value));
    }

    /// Retrieves a reference to a value via its [`TypeTag`] and [`MemberId`].
    pub(crate) fn retrieve<T: TypeTag>(&self, member: &MemberId) -> Result<&T::Value> {
        self.storage
            .get(&(member.clone(), TypeId::of::<T>()))
            .and_then(|any| any.downcast_ref::<T::Value>())
            .ok_or_else(|| {
                error!(
                    "Could not retrieve storage entry. Type: {:?}, member: {}",
                    std::any::type_name::<T::Value>(),
                    member
                );
                InternalError::InternalInvariantFailed
            })
    }

    /// Retrieves a mutable reference to a value via its [`TypeTag`] and
    /// [`MemberId`].
    pub(crate) fn retrieve_mut<T: TypeTag>(&mut self, member: &MemberId) -> Option<&mut T::Value> {
        self.storage
            .get_mut(&(member.clone(), TypeId::of::<T>()))
            .and_then(|any| any.downcast_mut::<T::Value>())
    }

    /// Checks whether values exist for the given [`TypeTag`] and each of the
    /// `members` provided.
    pub(crate) fn contains_for_all_ids<T: TypeTag>(&self, members: &[MemberId]) -> bool {
        members.iter().all(|member| self.contains::<T>(member))
    }

    /// Returns `true` if a value exists for the given [`TypeTag`] and
    /// [`MemberId`].
    pub(crate) fn contains<T: TypeTag>(&self, member: &MemberId) -> bool {
        self.storage
            .contains_key(&(member.clone(), TypeId::of::<T>()))
    }
}
