/* In-memory device model: the five host-side profiles and the active selection. */

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::driver::g502::MAX_PROFILES;

/* 24-bit color. Stored per profile but never sent to the device. */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    /* Split a `0xRRGGBB` value into its components. */
    pub fn from_u32(value: u32) -> Self {
        Self {
            red: ((value >> 16) & 0xFF) as u8,
            green: ((value >> 8) & 0xFF) as u8,
            blue: (value & 0xFF) as u8,
        }
    }

    pub fn to_u32(self) -> u32 {
        u32::from(self.red) << 16 | u32::from(self.green) << 8 | u32::from(self.blue)
    }
}

/* One saved configuration slot. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub index: usize,
    pub report_rate_hz: u16,
    pub dpi: u16,
    pub rgb: Rgb,
}

impl Profile {
    pub fn new(report_rate_hz: u16, dpi: u16) -> Self {
        Self {
            index: 0,
            report_rate_hz,
            dpi,
            rgb: Rgb::default(),
        }
    }
}

/* Reference defaults: rising rate and DPI, with the last two slots at 1000 Hz. */
pub fn default_profiles() -> [Profile; MAX_PROFILES] {
    const DEFAULTS: [(u16, u16); MAX_PROFILES] =
        [(125, 800), (250, 1600), (500, 2400), (1000, 3200), (1000, 6000)];

    let mut profiles = DEFAULTS.map(|(rate, dpi)| Profile::new(rate, dpi));
    for (i, profile) in profiles.iter_mut().enumerate() {
        profile.index = i;
    }
    profiles
}

/* Ordered, circular collection of profiles plus the active selection. */
/*  */
/* The store is seeded exactly once at attach and never grows or shrinks */
/* afterwards. Accessing an empty store is a programming error and panics. */
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: Vec<Profile>,
    current: usize,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(defaults: [Profile; MAX_PROFILES]) -> Self {
        let mut store = Self::new();
        store.initialize(defaults);
        store
    }

    /* Seed the store. Indices are reassigned from position so they stay */
    /* unique and contiguous. */
    pub fn initialize(&mut self, defaults: [Profile; MAX_PROFILES]) {
        assert!(
            self.profiles.is_empty(),
            "profile store initialized twice"
        );

        self.profiles = defaults
            .into_iter()
            .enumerate()
            .map(|(index, profile)| Profile { index, ..profile })
            .collect();
        self.current = 0;
    }

    pub fn is_initialized(&self) -> bool {
        !self.profiles.is_empty()
    }

    /* Move the selection to the circular successor and return it. */
    pub fn advance_current(&mut self) -> &Profile {
        assert!(self.is_initialized(), "profile store is empty");
        self.current = (self.current + 1) % self.profiles.len();
        &self.profiles[self.current]
    }

    /* The profile `advance_current` would select, without selecting it. */
    pub fn peek_next(&self) -> &Profile {
        assert!(self.is_initialized(), "profile store is empty");
        &self.profiles[(self.current + 1) % self.profiles.len()]
    }

    pub fn current(&self) -> &Profile {
        &self.profiles[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Profile {
        &mut self.profiles[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }
}

/* Shared device state guarded by the single exclusion lock. */
/*  */
/* Cloning the handle shares the same store. The lock protects only the */
/* in-memory model and is never held across a transport call. */
#[derive(Debug, Clone)]
pub struct DeviceState {
    inner: Arc<Mutex<ProfileStore>>,
}

impl DeviceState {
    pub fn new(defaults: [Profile; MAX_PROFILES]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProfileStore::with_profiles(defaults))),
        }
    }

    /* Blocking acquisition, for the control-surface and controller paths. */
    pub fn lock(&self) -> MutexGuard<'_, ProfileStore> {
        self.inner.lock()
    }

    /* Non-blocking acquisition, for the inbound delivery path. */
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ProfileStore>> {
        self.inner.try_lock()
    }

    /* Copy of the active profile. */
    pub fn current(&self) -> Profile {
        *self.lock().current()
    }

    pub fn snapshot(&self) -> Vec<Profile> {
        self.lock().profiles().to_vec()
    }
}
