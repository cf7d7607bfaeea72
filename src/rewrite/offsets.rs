//! Maps helper-call locations back to the allocation they report.
//!
//! A stack walk taken inside the helper sees the location of the injected
//! `invokestatic` in the rewritten method. The report names the `new*`
//! instruction instead, at its offset in the class as it was loaded.

use super::inject::MethodSites;
use log::debug;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    class: String,
    name: String,
    descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Calls {
    /// Call location to allocation offset.
    Known(HashMap<u32, u32>),
    /// Two classes with this name were rewritten differently.
    Conflicting,
}

/// Call offsets of every rewritten method, keyed by class, method name and
/// descriptor.
#[derive(Debug, Default, Clone)]
pub struct SiteOffsets {
    methods: HashMap<MethodKey, Calls>,
}

impl SiteOffsets {
    /// Records the helper calls of one rewritten class. A method that was
    /// already seen with different offsets (same name, other loader) stops
    /// translating.
    pub fn register(&mut self, class: &str, methods: &[MethodSites]) {
        for method in methods {
            let key = MethodKey {
                class: class.to_owned(),
                name: method.name.clone(),
                descriptor: method.descriptor.clone(),
            };
            let calls: HashMap<u32, u32> = method.sites.iter().map(|site| (site.call_pc, site.bci)).collect();
            match self.methods.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(Calls::Known(calls));
                }
                Entry::Occupied(mut slot) => {
                    let agrees = match slot.get() {
                        Calls::Known(known) => *known == calls,
                        Calls::Conflicting => true,
                    };
                    if !agrees {
                        debug!(
                            "{class}.{}{} rewritten twice with different layouts; reporting call offsets",
                            method.name, method.descriptor
                        );
                        slot.insert(Calls::Conflicting);
                    }
                }
            }
        }
    }

    /// The offset of the allocation whose helper call sits at `location`
    /// in `class.name descriptor`, if that call was injected here.
    pub fn original_bci(&self, class: &str, name: &str, descriptor: &str, location: i64) -> Option<i64> {
        let key = MethodKey { class: class.to_owned(), name: name.to_owned(), descriptor: descriptor.to_owned() };
        match self.methods.get(&key)? {
            Calls::Known(calls) => {
                let pc = u32::try_from(location).ok()?;
                calls.get(&pc).map(|&bci| i64::from(bci))
            }
            Calls::Conflicting => None,
        }
    }

    /// Number of rewritten methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
