/* Userspace driver for the Logitech G502 HERO.
 *
 * The daemon binary wires these modules to udev and the system bus; the
 * library is also what the tests and the simulated device build on. */

pub mod attributes;
pub mod config;
pub mod controller;
pub mod correlator;
pub mod dbus;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod input;
pub mod session;
pub mod test_device;
pub mod udev_monitor;
