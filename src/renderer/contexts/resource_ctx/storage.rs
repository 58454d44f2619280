use std::collections::hash_map::Entry;
use std::collections::HashMap;
use crate::renderer::error::{RegistryKind, RegistryScope, RenderError, Result};
use crate::renderer::resources::buffer::Buffer;
use crate::renderer::resources::constant_buffer::ConstantBuffer;
use crate::renderer::resources::texture::Texture;

/// Resources of one kind, unique by name within their scope
#[derive(Debug)]
pub struct NamedMap<T> {
    kind: RegistryKind,
    scope: RegistryScope,
    entries: HashMap<String, T>,
}

impl<T> NamedMap<T> {
    fn new(kind: RegistryKind, scope: RegistryScope) -> Self {
        Self {
            kind,
            scope,
            entries: HashMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Fails if `name` is taken, before anything is created for it
    pub fn ensure_vacant(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            return Err(self.duplicate(name));
        }
        Ok(())
    }

    pub fn insert(&mut self, name: &str, value: T) -> Result<&mut T> {
        let duplicate = self.duplicate(name);
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(_) => Err(duplicate),
            Entry::Vacant(entry) => Ok(entry.insert(value)),
        }
    }

    pub fn get(&self, name: &str) -> Result<&T> {
        self.entries.get(name).ok_or_else(|| self.unknown(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut T> {
        let unknown = self.unknown(name);
        self.entries.get_mut(name).ok_or(unknown)
    }

    pub fn remove(&mut self, name: &str) -> Result<T> {
        let unknown = self.unknown(name);
        self.entries.remove(name).ok_or(unknown)
    }

    fn duplicate(&self, name: &str) -> RenderError {
        RenderError::DuplicateName {
            kind: self.kind,
            name: name.to_string(),
            scope: self.scope,
        }
    }

    fn unknown(&self, name: &str) -> RenderError {
        RenderError::UnknownName {
            kind: self.kind,
            name: name.to_string(),
            scope: self.scope,
        }
    }
}

/// Everything registered for one frame slot, or once for the unique registry
#[derive(Debug)]
pub struct ResourceRegistry {
    scope: RegistryScope,
    pub textures: NamedMap<Texture>,
    pub buffers: NamedMap<Buffer>,
    pub constant_buffers: NamedMap<ConstantBuffer>,
}

impl ResourceRegistry {
    pub fn new(scope: RegistryScope) -> Self {
        Self {
            scope,
            textures: NamedMap::new(RegistryKind::Texture, scope),
            buffers: NamedMap::new(RegistryKind::Buffer, scope),
            constant_buffers: NamedMap::new(RegistryKind::ConstantBuffer, scope),
        }
    }

    pub fn scope(&self) -> RegistryScope {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.textures.len() + self.buffers.len() + self.constant_buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend debug name: per-frame resources carry their slot
    pub fn debug_name(&self, name: &str) -> String {
        match self.scope {
            RegistryScope::Frame(slot) => format!("{}[{}]", name, slot),
            RegistryScope::Unique => name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_per_map() {
        let mut map = NamedMap::new(RegistryKind::Buffer, RegistryScope::Frame(1));
        map.insert("Lights", 1).unwrap();
        assert!(matches!(
            map.insert("Lights", 2),
            Err(RenderError::DuplicateName { kind: RegistryKind::Buffer, scope: RegistryScope::Frame(1), .. })
        ));
        assert_eq!(*map.get("Lights").unwrap(), 1);
        assert!(map.ensure_vacant("Shadows").is_ok());

        assert_eq!(map.remove("Lights").unwrap(), 1);
        assert!(matches!(map.get("Lights"), Err(RenderError::UnknownName { .. })));
        assert!(map.is_empty());
    }

    #[test]
    fn debug_names_carry_the_frame_slot() {
        assert_eq!(ResourceRegistry::new(RegistryScope::Frame(2)).debug_name("Color"), "Color[2]");
        assert_eq!(ResourceRegistry::new(RegistryScope::Unique).debug_name("Color"), "Color");
    }
}
