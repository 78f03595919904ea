use std::collections::HashMap;
use std::collections::hash_map::Entry::{Occupied, Vacant};

/// Interns strings as small integer codes.
/// Gene ids repeat on every GTF line, so we only keep one copy of each.
#[derive(Debug, Clone, Default)]
pub struct Categorical {
    codes: HashMap<String, u32>,
    names: Vec<String>,
    last: String,
    last_no: u32,
}

impl Categorical {
    pub fn new() -> Categorical {
        Categorical::default()
    }

    /// code for value, allocating a new one if we haven't seen it
    pub fn intern(&mut self, value: &str) -> u32 {
        if !self.names.is_empty() && value == self.last {
            // GTFs are grouped by gene, this saves the hash lookup most of the time
            return self.last_no;
        }
        let next = self.names.len() as u32;
        let no = match self.codes.entry(value.to_string()) {
            Vacant(entry) => {
                self.names.push(value.to_string());
                *entry.insert(next)
            }
            Occupied(entry) => *entry.get(),
        };
        self.last_no = no;
        self.last = value.to_string();
        no
    }

    /// retrieve the name of a category from it's code.
    pub fn name(&self, code: u32) -> Option<&str> {
        self.names.get(code as usize).map(|s| s.as_str())
    }

    /// all categories, in order of first appearance
    pub fn names(&self) -> &[String] {
        &self.names
    }
}
