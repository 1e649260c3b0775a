//! Splitting of phase objects into ObjectSlices

use crate::crd::{ObjectSetObject, ObjectSetTemplatePhase};
use crate::error::Result;

/// Default binpack threshold, in serialized bytes
pub const DEFAULT_SLICE_THRESHOLD: usize = 256 * 1024;

/// Strategy deciding which objects of a phase move out into slices
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chunker {
    /// Keep every object inline
    NoOp,
    /// One slice per object
    EachObject,
    /// Pack objects in order into slices of at most `max_bytes`.
    /// Phases within the threshold stay inline.
    Binpack { max_bytes: usize },
}

impl Default for Chunker {
    fn default() -> Self {
        Chunker::Binpack {
            max_bytes: DEFAULT_SLICE_THRESHOLD,
        }
    }
}

impl Chunker {
    /// Object chunks for the slices of `phase`, in order.
    /// An empty result keeps the phase inline.
    pub fn chunk(&self, phase: &ObjectSetTemplatePhase) -> Result<Vec<Vec<ObjectSetObject>>> {
        match *self {
            Chunker::NoOp => Ok(vec![]),
            Chunker::EachObject => Ok(phase.objects.iter().map(|o| vec![o.clone()]).collect()),
            Chunker::Binpack { max_bytes } => binpack(&phase.objects, max_bytes),
        }
    }
}

fn binpack(objects: &[ObjectSetObject], max_bytes: usize) -> Result<Vec<Vec<ObjectSetObject>>> {
    let sizes = objects
        .iter()
        .map(|o| serde_json::to_vec(o).map(|b| b.len()))
        .collect::<Result<Vec<_>, _>>()?;
    if sizes.iter().sum::<usize>() <= max_bytes {
        return Ok(vec![]);
    }

    let mut chunks = vec![];
    let mut current: Vec<ObjectSetObject> = vec![];
    let mut current_size = 0;
    for (obj, size) in objects.iter().zip(sizes) {
        if !current.is_empty() && current_size + size > max_bytes {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(obj.clone());
        current_size += size;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_map(name: &str, payload: usize) -> ObjectSetObject {
        ObjectSetObject::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name},
            "data": {"payload": "x".repeat(payload)}
        }))
    }

    fn phase(objects: Vec<ObjectSetObject>) -> ObjectSetTemplatePhase {
        ObjectSetTemplatePhase::inline("deploy", objects)
    }

    #[test]
    fn test_noop_keeps_phase_inline() {
        let p = phase(vec![config_map("a", 10), config_map("b", 10)]);
        assert!(Chunker::NoOp.chunk(&p).unwrap().is_empty());
    }

    #[test]
    fn test_each_object() {
        let p = phase(vec![config_map("a", 10), config_map("b", 10)]);
        let chunks = Chunker::EachObject.chunk(&p).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1][0], p.objects[1]);
    }

    #[test]
    fn test_binpack_small_phase_stays_inline() {
        let p = phase(vec![config_map("a", 10), config_map("b", 10)]);
        assert!(Chunker::default().chunk(&p).unwrap().is_empty());
    }

    #[test]
    fn test_binpack_keeps_order_and_bound() {
        let objects: Vec<_> = (0..5).map(|i| config_map(&format!("cm-{}", i), 300)).collect();
        let chunker = Chunker::Binpack { max_bytes: 1000 };
        let chunks = chunker.chunk(&phase(objects.clone())).unwrap();

        assert_eq!(chunks.len(), 3);
        let flattened: Vec<_> = chunks.iter().flatten().cloned().collect();
        assert_eq!(flattened, objects);
        for chunk in &chunks {
            let size: usize = chunk
                .iter()
                .map(|o| serde_json::to_vec(o).unwrap().len())
                .sum();
            assert!(size <= 1000);
        }
    }

    #[test]
    fn test_binpack_oversized_object_gets_own_slice() {
        let objects = vec![config_map("small", 10), config_map("huge", 2000), config_map("tail", 10)];
        let chunks = Chunker::Binpack { max_bytes: 1000 }
            .chunk(&phase(objects))
            .unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].len(), 1);
        assert_eq!(chunks[1][0].object["metadata"]["name"], "huge");
    }
}
