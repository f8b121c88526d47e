//! US ANSI virtual key codes.

/// (code, unshifted, shifted)
const CHAR_KEYS: &[(i64, char, char)] = &[
    (0, 'a', 'A'),
    (1, 's', 'S'),
    (2, 'd', 'D'),
    (3, 'f', 'F'),
    (4, 'h', 'H'),
    (5, 'g', 'G'),
    (6, 'z', 'Z'),
    (7, 'x', 'X'),
    (8, 'c', 'C'),
    (9, 'v', 'V'),
    (11, 'b', 'B'),
    (12, 'q', 'Q'),
    (13, 'w', 'W'),
    (14, 'e', 'E'),
    (15, 'r', 'R'),
    (16, 'y', 'Y'),
    (17, 't', 'T'),
    (18, '1', '!'),
    (19, '2', '@'),
    (20, '3', '#'),
    (21, '4', '$'),
    (22, '6', '^'),
    (23, '5', '%'),
    (24, '=', '+'),
    (25, '9', '('),
    (26, '7', '&'),
    (27, '-', '_'),
    (28, '8', '*'),
    (29, '0', ')'),
    (30, ']', '}'),
    (31, 'o', 'O'),
    (32, 'u', 'U'),
    (33, '[', '{'),
    (34, 'i', 'I'),
    (35, 'p', 'P'),
    (37, 'l', 'L'),
    (38, 'j', 'J'),
    (39, '\'', '"'),
    (40, 'k', 'K'),
    (41, ';', ':'),
    (42, '\\', '|'),
    (43, ',', '<'),
    (44, '/', '?'),
    (45, 'n', 'N'),
    (46, 'm', 'M'),
    (47, '.', '>'),
    (49, ' ', ' '),
    (50, '`', '~'),
];

const NAMED_KEYS: &[(i64, &str)] = &[
    (36, "enter"),
    (76, "enter"),
    (48, "tab"),
    (51, "backspace"),
    (53, "esc"),
    (114, "help"),
    (115, "home"),
    (116, "pageup"),
    (117, "delete"),
    (119, "end"),
    (121, "pagedown"),
    (123, "left"),
    (124, "right"),
    (125, "down"),
    (126, "up"),
    (122, "f1"),
    (120, "f2"),
    (99, "f3"),
    (118, "f4"),
    (96, "f5"),
    (97, "f6"),
    (98, "f7"),
    (100, "f8"),
    (101, "f9"),
    (109, "f10"),
    (103, "f11"),
    (111, "f12"),
];

pub fn char_for_code(code: i64, shifted: bool) -> Option<char> {
    CHAR_KEYS
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|&(_, plain, shift)| if shifted { shift } else { plain })
}

pub fn name_for_code(code: i64) -> Option<&'static str> {
    NAMED_KEYS.iter().find(|(c, _)| *c == code).map(|(_, name)| *name)
}

/// Key code for a key name as it appears in a `key_sequence`.
pub fn code_for_name(name: &str) -> Option<i64> {
    let name = match name {
        "return" => "enter",
        "escape" => "esc",
        "del" | "forwarddelete" => "delete",
        "page_up" | "pgup" => "pageup",
        "page_down" | "pgdn" => "pagedown",
        "arrowleft" => "left",
        "arrowright" => "right",
        "arrowup" => "up",
        "arrowdown" => "down",
        "space" => return Some(49),
        other => other,
    };
    NAMED_KEYS.iter().find(|(_, n)| *n == name).map(|(code, _)| *code)
}

/// AppleScript `using` clause entry for a modifier name.
pub fn modifier_clause(name: &str) -> Option<&'static str> {
    match name {
        "cmd" | "command" | "win" | "super" | "meta" => Some("command down"),
        "ctrl" | "control" => Some("control down"),
        "alt" | "option" | "opt" => Some("option down"),
        "shift" => Some("shift down"),
        _ => None,
    }
}
