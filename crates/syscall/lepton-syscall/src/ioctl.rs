//! ioctl request numbers understood by the core (tty, keyboard, generic).

// Termios.
pub const TCGETS: u32 = 0x5401;
pub const TCSETS: u32 = 0x5402;
pub const TCSETSW: u32 = 0x5403;
pub const TCSETSF: u32 = 0x5404;

// Terminal control.
pub const TIOCGPGRP: u32 = 0x540F;
pub const TIOCSPGRP: u32 = 0x5410;
pub const TIOCGWINSZ: u32 = 0x5413;
pub const TIOCSWINSZ: u32 = 0x5414;

// Generic.
pub const FIONREAD: u32 = 0x541B;
pub const FIONBIO: u32 = 0x5421;

// Keyboard / console.
pub const KDSETMODE: u32 = 0x4B3A;
pub const KDGETMODE: u32 = 0x4B3B;
pub const KDGKBMODE: u32 = 0x4B44;
pub const KDSKBMODE: u32 = 0x4B45;
pub const KDGKBENT: u32 = 0x4B46;
pub const KDSKBENT: u32 = 0x4B47;

/// `KDSETMODE` arguments.
pub const KD_TEXT: u32 = 0;
pub const KD_GRAPHICS: u32 = 1;

/// `KDSKBMODE` arguments.
pub const K_RAW: u32 = 0;
pub const K_XLATE: u32 = 1;
