//! Process-wide proto descriptor registry.
//!
//! Registration is idempotent: files already present are skipped, as are
//! files whose top-level symbols would collide with registered ones.
//! Operators share this registry across threads, hence the mutex.

use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use prost_reflect::{DescriptorPool, ServiceDescriptor};
use prost_types::{FileDescriptorProto, FileDescriptorSet};

static POOL: Lazy<Mutex<DescriptorPool>> = Lazy::new(|| Mutex::new(DescriptorPool::new()));

fn with_pool<T>(f: impl FnOnce(&mut DescriptorPool) -> T) -> T {
    let mut guard = POOL.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

pub(crate) fn service_by_name(name: &str) -> Option<ServiceDescriptor> {
    with_pool(|pool| pool.get_service_by_name(name))
}

pub(crate) fn file_count() -> usize {
    with_pool(|pool| pool.files().count())
}

/// Register every file of `set` not yet present. Files arrive in no
/// particular dependency order (reflection servers make no promise), so
/// registration retries until a pass makes no progress.
pub(crate) fn register_files(set: &FileDescriptorSet) -> Result<(), String> {
    with_pool(|pool| {
        let mut pending: Vec<&FileDescriptorProto> = set.file.iter().collect();
        loop {
            let mut next = Vec::new();
            let mut progressed = false;
            let mut last_err = None;
            for fd in pending {
                if pool.get_file_by_name(fd.name()).is_some() {
                    continue;
                }
                if has_top_level_conflict(pool, fd) {
                    continue;
                }
                match pool.add_file_descriptor_proto(fd.clone()) {
                    Ok(()) => progressed = true,
                    Err(e) => {
                        last_err = Some(e.to_string());
                        next.push(fd);
                    }
                }
            }
            if next.is_empty() {
                return Ok(());
            }
            if !progressed {
                return Err(last_err.unwrap_or_else(|| "descriptor registration stalled".into()));
            }
            pending = next;
        }
    })
}

fn has_top_level_conflict(pool: &DescriptorPool, fd: &FileDescriptorProto) -> bool {
    let pkg = fd.package();
    let full = |name: &str| {
        if pkg.is_empty() {
            name.to_string()
        } else {
            format!("{pkg}.{name}")
        }
    };
    fd.message_type
        .iter()
        .any(|m| pool.get_message_by_name(&full(m.name())).is_some())
        || fd
            .enum_type
            .iter()
            .any(|e| pool.get_enum_by_name(&full(e.name())).is_some())
        || fd
            .service
            .iter()
            .any(|s| pool.get_service_by_name(&full(s.name())).is_some())
        || fd
            .extension
            .iter()
            .any(|x| pool.get_extension_by_name(&full(x.name())).is_some())
}
