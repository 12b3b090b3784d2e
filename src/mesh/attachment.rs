//! Per-cell data attachments carried through a mesh checkpoint.
//!
//! A client registers an attachment before the mesh is saved, giving one
//! placeholder size per locally owned cell, and then fills every slot with
//! exactly that many bytes. After a load, the bytes reappear on whichever
//! rank now owns the cell, addressed through the new local cell list.

use bytes::Bytes;

/// Names one registered attachment. Handles are small integers assigned in
/// registration order and survive a save/load cycle unchanged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AttachmentHandle(pub(crate) u32);

impl AttachmentHandle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Attachment {
    /// Placeholder size per local slot; `None` once the data came from disk.
    sizes: Option<Vec<usize>>,
    data: Vec<Option<Bytes>>,
}

impl Attachment {
    pub(crate) fn registered(sizes: Vec<usize>) -> Self {
        let data = vec![None; sizes.len()];
        Self {
            sizes: Some(sizes),
            data,
        }
    }

    pub(crate) fn loaded(data: Vec<Bytes>) -> Self {
        Self {
            sizes: None,
            data: data.into_iter().map(Some).collect(),
        }
    }

    pub(crate) fn expected(&self, slot: usize) -> Option<usize> {
        self.sizes.as_ref().and_then(|s| s.get(slot).copied())
    }

    pub(crate) fn set(&mut self, slot: usize, bytes: Bytes) {
        if let Some(entry) = self.data.get_mut(slot) {
            *entry = Some(bytes);
        }
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&Bytes> {
        self.data.get(slot).and_then(Option::as_ref)
    }

    /// First slot whose content does not match its placeholder. Zero-sized
    /// placeholders may be left unfilled.
    pub(crate) fn first_unfilled(&self) -> Option<usize> {
        let sizes = self.sizes.as_ref()?;
        sizes.iter().zip(&self.data).position(|(&size, data)| match data {
            Some(bytes) => bytes.len() != size,
            None => size != 0,
        })
    }

    /// Bytes of `slot`, empty when the slot was never filled.
    pub(crate) fn bytes_or_empty(&self, slot: usize) -> Bytes {
        self.get(slot).cloned().unwrap_or_default()
    }
}

/// All attachments registered on one mesh instance.
#[derive(Clone, Debug, Default)]
pub(crate) struct AttachmentRegistry {
    slots: Vec<Attachment>,
}

impl AttachmentRegistry {
    pub(crate) fn push(&mut self, attachment: Attachment) -> AttachmentHandle {
        self.slots.push(attachment);
        AttachmentHandle((self.slots.len() - 1) as u32)
    }

    pub(crate) fn get(&self, handle: AttachmentHandle) -> Option<&Attachment> {
        self.slots.get(handle.0 as usize)
    }

    pub(crate) fn get_mut(&mut self, handle: AttachmentHandle) -> Option<&mut Attachment> {
        self.slots.get_mut(handle.0 as usize)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (AttachmentHandle, &Attachment)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, a)| (AttachmentHandle(i as u32), a))
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfilled_slots_are_reported() {
        let mut a = Attachment::registered(vec![4, 0, 2]);
        assert_eq!(a.first_unfilled(), Some(0));
        a.set(0, Bytes::from_static(&[1, 2, 3, 4]));
        assert_eq!(a.first_unfilled(), Some(2));
        a.set(2, Bytes::from_static(&[9]));
        assert_eq!(a.first_unfilled(), Some(2));
        a.set(2, Bytes::from_static(&[9, 9]));
        assert_eq!(a.first_unfilled(), None);
        assert!(a.bytes_or_empty(1).is_empty());
    }

    #[test]
    fn handles_follow_registration_order() {
        let mut reg = AttachmentRegistry::default();
        let h0 = reg.push(Attachment::registered(vec![]));
        let h1 = reg.push(Attachment::loaded(vec![Bytes::from_static(b"x")]));
        assert_eq!((h0.get(), h1.get()), (0, 1));
        assert_eq!(reg.get(h1).and_then(|a| a.get(0)).map(|b| b.as_ref()), Some(&b"x"[..]));
        assert_eq!(reg.len(), 2);
    }
}
