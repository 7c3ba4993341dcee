//! Hand-written method bodies spliced into the protection classes.

/// `VMRunner.<clinit>()V`: load the side-loaded replacement core before the
/// original one so the VM entry points resolve to it.
pub const LOADER_CLINIT: &[&str] = &[
    ".method static constructor <clinit>()V",
    "    .registers 1",
    "",
    "    const-string v0, \"pairipcorex\"",
    "    invoke-static {v0}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V",
    "",
    "    const-string v0, \"pairipcore\"",
    "    invoke-static {v0}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V",
    "",
    "    return-void",
    ".end method",
];

/// Body of a `void` method that does nothing. `.locals` leaves the
/// parameter registers to the assembler, so it suits any descriptor.
pub const RETURN_VOID: &[&str] = &["    .locals 0", "", "    return-void"];

/// Body of a `boolean` method that always answers `true`.
pub const RETURN_TRUE: &[&str] = &[
    "    .locals 1",
    "",
    "    const/4 v0, 0x1",
    "",
    "    return v0",
];
