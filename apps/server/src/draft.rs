//! The booking wizard state machine.
//!
//! One tagged state per wizard step, each carrying only the data that is
//! valid at that step, so a slot cannot be selected before a product
//! exists and a payment cannot start before a booking does. A rejected
//! guard leaves the state untouched and names the missing field.
//!
//! Drafts are ephemeral: they live in the in-memory `WizardStore` for
//! the duration of one wizard session and are dropped on completion or
//! abandon. Everything that must survive a page reload (the pending
//! booking, the payment session) is persisted by the services instead.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DraftError {
    #[error("product is not selected")]
    MissingProduct,
    #[error("date is not selected")]
    MissingDate,
    #[error("time slot is not selected")]
    MissingSlot,
    #[error("at least one pet must be selected")]
    NoPetsSelected,
    #[error("required agreements are not accepted")]
    AgreementsNotAccepted,
    #[error("action not allowed at the current step")]
    InvalidTransition,
}

/// The product selection, denormalized so price derivation needs no
/// further lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductChoice {
    pub product_id: i64,
    pub company_id: i64,
    pub price: i64,
    pub all_day: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChoice {
    pub date: String,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Agreements {
    pub service_terms: bool,
    pub cancellation_policy: bool,
}

impl Agreements {
    pub fn all_accepted(self) -> bool {
        self.service_terms && self.cancellation_policy
    }
}

#[derive(Debug, Clone)]
pub enum BookingDraft {
    SelectingProduct,
    SelectingSlotAndPets {
        product: ProductChoice,
        slot: Option<SlotChoice>,
        pets: BTreeSet<i64>,
        special_requests: Option<String>,
    },
    Confirming {
        product: ProductChoice,
        slot: SlotChoice,
        pets: BTreeSet<i64>,
        special_requests: Option<String>,
        agreements: Agreements,
    },
    Paying {
        product: ProductChoice,
        slot: SlotChoice,
        pets: BTreeSet<i64>,
        booking_id: i64,
        order_id: String,
    },
    Completed {
        booking_id: i64,
    },
}

impl BookingDraft {
    pub fn new() -> Self {
        BookingDraft::SelectingProduct
    }

    pub fn step_name(&self) -> &'static str {
        match self {
            BookingDraft::SelectingProduct => "selecting_product",
            BookingDraft::SelectingSlotAndPets { .. } => "selecting_slot_and_pets",
            BookingDraft::Confirming { .. } => "confirming",
            BookingDraft::Paying { .. } => "paying",
            BookingDraft::Completed { .. } => "completed",
        }
    }

    /// Derived, never stored: product price × selected pet count.
    pub fn total_price(&self) -> Option<i64> {
        match self {
            BookingDraft::SelectingSlotAndPets { product, pets, .. }
            | BookingDraft::Confirming { product, pets, .. }
            | BookingDraft::Paying { product, pets, .. } => {
                Some(product.price * pets.len() as i64)
            }
            _ => None,
        }
    }

    /// Select (or change) the product.
    ///
    /// Changing the product invalidates the slot, which was chosen for
    /// its schedule; the pet selection does not depend on the product
    /// and survives.
    pub fn select_product(&mut self, choice: ProductChoice) -> Result<(), DraftError> {
        match self {
            BookingDraft::SelectingProduct => {
                *self = BookingDraft::SelectingSlotAndPets {
                    product: choice,
                    slot: None,
                    pets: BTreeSet::new(),
                    special_requests: None,
                };
                Ok(())
            }
            BookingDraft::SelectingSlotAndPets { product, slot, .. } => {
                if *product != choice {
                    *slot = None;
                    *product = choice;
                }
                Ok(())
            }
            _ => Err(DraftError::InvalidTransition),
        }
    }

    pub fn select_slot(&mut self, choice: SlotChoice) -> Result<(), DraftError> {
        match self {
            BookingDraft::SelectingProduct => Err(DraftError::MissingProduct),
            BookingDraft::SelectingSlotAndPets { slot, .. } => {
                *slot = Some(choice);
                Ok(())
            }
            _ => Err(DraftError::InvalidTransition),
        }
    }

    pub fn set_pets(&mut self, pet_ids: BTreeSet<i64>) -> Result<(), DraftError> {
        match self {
            BookingDraft::SelectingProduct => Err(DraftError::MissingProduct),
            BookingDraft::SelectingSlotAndPets { pets, .. } => {
                *pets = pet_ids;
                Ok(())
            }
            _ => Err(DraftError::InvalidTransition),
        }
    }

    pub fn set_special_requests(&mut self, text: Option<String>) -> Result<(), DraftError> {
        match self {
            BookingDraft::SelectingSlotAndPets {
                special_requests, ..
            }
            | BookingDraft::Confirming {
                special_requests, ..
            } => {
                *special_requests = text;
                Ok(())
            }
            _ => Err(DraftError::InvalidTransition),
        }
    }

    /// Advance to the confirmation step. Requires a slot (which carries
    /// the date) and at least one pet.
    pub fn to_confirming(&mut self) -> Result<(), DraftError> {
        match self {
            BookingDraft::SelectingProduct => Err(DraftError::MissingProduct),
            BookingDraft::Confirming { .. } => Ok(()), // already there
            BookingDraft::SelectingSlotAndPets {
                product,
                slot,
                pets,
                special_requests,
            } => {
                let slot = match slot {
                    Some(s) => s.clone(),
                    None => return Err(DraftError::MissingSlot),
                };
                if pets.is_empty() {
                    return Err(DraftError::NoPetsSelected);
                }
                *self = BookingDraft::Confirming {
                    product: product.clone(),
                    slot,
                    pets: std::mem::take(pets),
                    special_requests: special_requests.take(),
                    agreements: Agreements::default(),
                };
                Ok(())
            }
            _ => Err(DraftError::InvalidTransition),
        }
    }

    pub fn set_agreements(&mut self, accepted: Agreements) -> Result<(), DraftError> {
        match self {
            BookingDraft::Confirming { agreements, .. } => {
                *agreements = accepted;
                Ok(())
            }
            _ => Err(DraftError::InvalidTransition),
        }
    }

    /// Advance to the payment step once the booking has been persisted
    /// and the payment session opened. Requires every agreement.
    pub fn to_paying(&mut self, booking_id: i64, order_id: String) -> Result<(), DraftError> {
        match self {
            BookingDraft::Confirming {
                product,
                slot,
                pets,
                agreements,
                ..
            } => {
                if !agreements.all_accepted() {
                    return Err(DraftError::AgreementsNotAccepted);
                }
                *self = BookingDraft::Paying {
                    product: product.clone(),
                    slot: slot.clone(),
                    pets: std::mem::take(pets),
                    booking_id,
                    order_id,
                };
                Ok(())
            }
            _ => Err(DraftError::InvalidTransition),
        }
    }

    /// Finish the wizard. Only valid once payment reconciliation has
    /// confirmed the booking; the caller verifies that.
    pub fn complete(&mut self) -> Result<i64, DraftError> {
        match self {
            BookingDraft::Paying { booking_id, .. } => {
                let id = *booking_id;
                *self = BookingDraft::Completed { booking_id: id };
                Ok(id)
            }
            BookingDraft::Completed { booking_id } => Ok(*booking_id), // idempotent
            _ => Err(DraftError::InvalidTransition),
        }
    }

    /// Navigate one step back, keeping every selection that is still
    /// valid. Backing out of an in-flight payment is not a wizard move:
    /// a pending booking and an open payment session exist at that
    /// point, so the way out is cancelling the booking (or the
    /// payment-failed cleanup endpoint once the attempt has resolved),
    /// never a silent draft rewind.
    pub fn back(&mut self) -> Result<(), DraftError> {
        match self {
            // Re-opening an earlier picker does not change engine state;
            // selections are only cleared when a dependency changes.
            BookingDraft::SelectingProduct | BookingDraft::SelectingSlotAndPets { .. } => Ok(()),
            BookingDraft::Confirming {
                product,
                slot,
                pets,
                special_requests,
                ..
            } => {
                *self = BookingDraft::SelectingSlotAndPets {
                    product: product.clone(),
                    slot: Some(slot.clone()),
                    pets: std::mem::take(pets),
                    special_requests: special_requests.take(),
                };
                Ok(())
            }
            BookingDraft::Paying { .. } | BookingDraft::Completed { .. } => {
                Err(DraftError::InvalidTransition)
            }
        }
    }
}

impl Default for BookingDraft {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of a draft for the wizard UI.
#[derive(Debug, Serialize)]
pub struct DraftView {
    pub step: &'static str,
    pub product_id: Option<i64>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub pet_ids: Vec<i64>,
    pub total_price: Option<i64>,
    pub booking_id: Option<i64>,
    pub order_id: Option<String>,
}

impl From<&BookingDraft> for DraftView {
    fn from(draft: &BookingDraft) -> Self {
        let mut view = DraftView {
            step: draft.step_name(),
            product_id: None,
            date: None,
            start_time: None,
            pet_ids: Vec::new(),
            total_price: draft.total_price(),
            booking_id: None,
            order_id: None,
        };
        match draft {
            BookingDraft::SelectingProduct => {}
            BookingDraft::SelectingSlotAndPets { product, slot, pets, .. } => {
                view.product_id = Some(product.product_id);
                view.date = slot.as_ref().map(|s| s.date.clone());
                view.start_time = slot.as_ref().map(|s| s.start_time.clone());
                view.pet_ids = pets.iter().copied().collect();
            }
            BookingDraft::Confirming { product, slot, pets, .. } => {
                view.product_id = Some(product.product_id);
                view.date = Some(slot.date.clone());
                view.start_time = Some(slot.start_time.clone());
                view.pet_ids = pets.iter().copied().collect();
            }
            BookingDraft::Paying { product, slot, pets, booking_id, order_id } => {
                view.product_id = Some(product.product_id);
                view.date = Some(slot.date.clone());
                view.start_time = Some(slot.start_time.clone());
                view.pet_ids = pets.iter().copied().collect();
                view.booking_id = Some(*booking_id);
                view.order_id = Some(order_id.clone());
            }
            BookingDraft::Completed { booking_id } => {
                view.booking_id = Some(*booking_id);
            }
        }
        view
    }
}

// ── Wizard store ──

/// In-memory store of active drafts, one per wizard session.
///
/// Single-writer by construction: each draft is owned by one session and
/// mutated under the map entry's lock.
#[derive(Debug, Default)]
pub struct WizardStore {
    next_id: AtomicU64,
    drafts: DashMap<u64, BookingDraft>,
}

impl WizardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.drafts.insert(id, BookingDraft::new());
        id
    }

    /// Run `f` against the draft, holding its entry lock for the whole
    /// mutation. Returns `None` for unknown or already-dropped wizards.
    pub fn with<R>(&self, id: u64, f: impl FnOnce(&mut BookingDraft) -> R) -> Option<R> {
        self.drafts.get_mut(&id).map(|mut entry| f(entry.value_mut()))
    }

    pub fn view(&self, id: u64) -> Option<DraftView> {
        self.drafts.get(&id).map(|entry| DraftView::from(entry.value()))
    }

    /// Drop a draft (wizard completed or abandoned).
    pub fn remove(&self, id: u64) -> bool {
        self.drafts.remove(&id).is_some()
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: i64, price: i64) -> ProductChoice {
        ProductChoice {
            product_id: id,
            company_id: 1,
            price,
            all_day: false,
        }
    }

    fn slot(date: &str, start: &str) -> SlotChoice {
        SlotChoice {
            date: date.into(),
            start_time: start.into(),
            end_time: "11:00".into(),
        }
    }

    fn pets(ids: &[i64]) -> BTreeSet<i64> {
        ids.iter().copied().collect()
    }

    fn accepted() -> Agreements {
        Agreements {
            service_terms: true,
            cancellation_policy: true,
        }
    }

    /// Drive a draft to the confirming step.
    fn confirming_draft() -> BookingDraft {
        let mut draft = BookingDraft::new();
        draft.select_product(product(1, 80_000)).unwrap();
        draft.select_slot(slot("2026-03-03", "10:00")).unwrap();
        draft.set_pets(pets(&[7, 8])).unwrap();
        draft.to_confirming().unwrap();
        draft
    }

    // ── guards ──

    #[test]
    fn test_slot_before_product_rejected() {
        let mut draft = BookingDraft::new();
        let err = draft.select_slot(slot("2026-03-03", "10:00")).unwrap_err();
        assert_eq!(err, DraftError::MissingProduct);
        assert!(matches!(draft, BookingDraft::SelectingProduct));
    }

    #[test]
    fn test_confirm_without_slot_rejected() {
        let mut draft = BookingDraft::new();
        draft.select_product(product(1, 80_000)).unwrap();
        draft.set_pets(pets(&[7])).unwrap();
        assert_eq!(draft.to_confirming().unwrap_err(), DraftError::MissingSlot);
        assert_eq!(draft.step_name(), "selecting_slot_and_pets");
    }

    #[test]
    fn test_confirm_without_pets_rejected() {
        let mut draft = BookingDraft::new();
        draft.select_product(product(1, 80_000)).unwrap();
        draft.select_slot(slot("2026-03-03", "10:00")).unwrap();
        assert_eq!(draft.to_confirming().unwrap_err(), DraftError::NoPetsSelected);
        // selections survive the rejected guard
        assert!(matches!(
            &draft,
            BookingDraft::SelectingSlotAndPets { slot: Some(_), .. }
        ));
    }

    #[test]
    fn test_paying_requires_agreements() {
        let mut draft = confirming_draft();
        assert_eq!(
            draft.to_paying(1, "order-1".into()).unwrap_err(),
            DraftError::AgreementsNotAccepted
        );
        assert_eq!(draft.step_name(), "confirming");

        draft.set_agreements(accepted()).unwrap();
        draft.to_paying(42, "order-42-1".into()).unwrap();
        assert_eq!(draft.step_name(), "paying");
    }

    #[test]
    fn test_partial_agreements_rejected() {
        let mut draft = confirming_draft();
        draft
            .set_agreements(Agreements {
                service_terms: true,
                cancellation_policy: false,
            })
            .unwrap();
        assert_eq!(
            draft.to_paying(1, "order-1".into()).unwrap_err(),
            DraftError::AgreementsNotAccepted
        );
    }

    #[test]
    fn test_complete_only_from_paying() {
        let mut draft = confirming_draft();
        assert_eq!(draft.complete().unwrap_err(), DraftError::InvalidTransition);

        draft.set_agreements(accepted()).unwrap();
        draft.to_paying(42, "order-42-1".into()).unwrap();
        assert_eq!(draft.complete().unwrap(), 42);
        assert_eq!(draft.complete().unwrap(), 42); // idempotent
    }

    // ── price derivation ──

    #[test]
    fn test_total_price_two_pets() {
        let mut draft = BookingDraft::new();
        draft.select_product(product(1, 80_000)).unwrap();
        draft.set_pets(pets(&[7, 8])).unwrap();
        assert_eq!(draft.total_price(), Some(160_000));
    }

    #[test]
    fn test_total_price_tracks_pet_changes() {
        let mut draft = BookingDraft::new();
        draft.select_product(product(1, 50_000)).unwrap();
        draft.set_pets(pets(&[1])).unwrap();
        assert_eq!(draft.total_price(), Some(50_000));
        draft.set_pets(pets(&[1, 2, 3])).unwrap();
        assert_eq!(draft.total_price(), Some(150_000));
    }

    #[test]
    fn test_no_price_before_product() {
        assert_eq!(BookingDraft::new().total_price(), None);
    }

    // ── dependency invalidation ──

    #[test]
    fn test_changing_product_clears_slot_keeps_pets() {
        let mut draft = BookingDraft::new();
        draft.select_product(product(1, 80_000)).unwrap();
        draft.select_slot(slot("2026-03-03", "10:00")).unwrap();
        draft.set_pets(pets(&[7])).unwrap();

        draft.select_product(product(2, 90_000)).unwrap();
        match &draft {
            BookingDraft::SelectingSlotAndPets { slot, pets, .. } => {
                assert!(slot.is_none());
                assert_eq!(pets.len(), 1);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_reselecting_same_product_keeps_slot() {
        let mut draft = BookingDraft::new();
        draft.select_product(product(1, 80_000)).unwrap();
        draft.select_slot(slot("2026-03-03", "10:00")).unwrap();
        draft.select_product(product(1, 80_000)).unwrap();
        assert!(matches!(
            &draft,
            BookingDraft::SelectingSlotAndPets { slot: Some(_), .. }
        ));
    }

    // ── back navigation ──

    #[test]
    fn test_back_from_confirming_retains_selections() {
        let mut draft = confirming_draft();
        draft.back().unwrap();
        match &draft {
            BookingDraft::SelectingSlotAndPets { slot, pets, .. } => {
                assert_eq!(slot.as_ref().unwrap().start_time, "10:00");
                assert_eq!(pets.len(), 2);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_back_from_paying_rejected() {
        let mut draft = confirming_draft();
        draft.set_agreements(accepted()).unwrap();
        draft.to_paying(42, "order-42-1".into()).unwrap();
        assert_eq!(draft.back().unwrap_err(), DraftError::InvalidTransition);
        assert_eq!(draft.step_name(), "paying");
    }

    #[test]
    fn test_back_on_early_steps_is_noop() {
        let mut draft = BookingDraft::new();
        draft.back().unwrap();
        draft.select_product(product(1, 80_000)).unwrap();
        draft.back().unwrap();
        assert_eq!(draft.step_name(), "selecting_slot_and_pets");
    }

    // ── store ──

    #[test]
    fn test_store_lifecycle() {
        let store = WizardStore::new();
        let id = store.start();
        assert!(store.view(id).is_some());

        store
            .with(id, |d| d.select_product(product(1, 80_000)))
            .unwrap()
            .unwrap();
        assert_eq!(store.view(id).unwrap().step, "selecting_slot_and_pets");

        assert!(store.remove(id));
        assert!(!store.remove(id));
        assert!(store.view(id).is_none());
    }

    #[test]
    fn test_store_ids_unique() {
        let store = WizardStore::new();
        let a = store.start();
        let b = store.start();
        assert_ne!(a, b);
    }
}
