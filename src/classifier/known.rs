//! Built-in list of class ids abused in document-borne malware.

use uguid::{guid, Guid};

/// `(class id, description)` pairs loaded into every [`super::ClsidTable`].
pub static KNOWN_CLSIDS: &[(Guid, &str)] = &[
    // Packager
    (
        guid!("0003000C-0000-0000-C000-000000000046"),
        "OLE Package Object (may contain and run any file)",
    ),
    (
        guid!("0003000D-0000-0000-C000-000000000046"),
        "OLE Package Object (may contain and run any file)",
    ),
    (
        guid!("0003000E-0000-0000-C000-000000000046"),
        "OLE Package Object (may contain and run any file)",
    ),
    (
        guid!("F20DA720-C02F-11CE-927B-0800095AE340"),
        "OLE Package Object (may contain and run any file)",
    ),
    (
        guid!("00020C01-0000-0000-C000-000000000046"),
        "OLE Package Object (may contain and run any file)",
    ),
    (guid!("00000308-0000-0000-C000-000000000046"), "Packager Moniker"),
    // Monikers
    (
        guid!("00000300-0000-0000-C000-000000000046"),
        "StdOleLink (embedded OLE link, CVE-2017-0199, CVE-2017-8570, CVE-2017-8759, CVE-2018-8174)",
    ),
    (
        guid!("00000303-0000-0000-C000-000000000046"),
        "File Moniker (may trigger CVE-2017-0199 or CVE-2017-8570)",
    ),
    (guid!("00000304-0000-0000-C000-000000000046"), "Item Moniker"),
    (guid!("00000305-0000-0000-C000-000000000046"), "Anti Moniker"),
    (guid!("00000306-0000-0000-C000-000000000046"), "Pointer Moniker"),
    (
        guid!("00000309-0000-0000-C000-000000000046"),
        "Composite Moniker (may trigger CVE-2017-8570)",
    ),
    (guid!("0000031A-0000-0000-C000-000000000046"), "Class Moniker"),
    (
        guid!("79EAC9E0-BAF9-11CE-8C82-00AA004BA90B"),
        "StdHlink (hyperlink object)",
    ),
    (
        guid!("79EAC9E2-BAF9-11CE-8C82-00AA004BA90B"),
        "URL Moniker (may trigger CVE-2017-0199 or CVE-2017-8570)",
    ),
    (
        guid!("06290BD3-48AA-11D2-8432-006008C3FBFC"),
        "Script Moniker, Windows Script Component (may trigger CVE-2017-0199)",
    ),
    (
        guid!("06290BD2-48AA-11D2-8432-006008C3FBFC"),
        "Scriptlet factory bindable through IPersistMoniker",
    ),
    (
        guid!("ECABB0C7-7F19-11D2-978E-0000F8757E2A"),
        "SOAP Moniker (may trigger CVE-2017-8759)",
    ),
    (
        guid!("3050F4D8-98B5-11CF-BB82-00AA00BDCE0B"),
        "HTML Application (may trigger CVE-2017-0199)",
    ),
    // Equation Editor
    (
        guid!("0002CE02-0000-0000-C000-000000000046"),
        "Microsoft Equation 3.0 (CVE-2017-11882 or CVE-2018-0802)",
    ),
    (
        guid!("0003000B-0000-0000-C000-000000000046"),
        "Microsoft Equation (CVE-2017-11882 or CVE-2018-0802)",
    ),
    (
        guid!("0004A6B0-0000-0000-C000-000000000046"),
        "Microsoft Equation 2.0 (CVE-2017-11882 or CVE-2018-0802)",
    ),
    // Script hosts
    (
        guid!("0E59F1D5-1FBE-11D0-8FF2-00A0D10038BC"),
        "MSScriptControl.ScriptControl (may trigger CVE-2015-0097)",
    ),
    (
        guid!("00000535-0000-0010-8000-00AA006D2EA4"),
        "ADODB.RecordSet (may trigger CVE-2015-0097)",
    ),
    // ActiveX controls
    (
        guid!("BDD1F04B-858B-11D1-B16A-00C0F0283628"),
        "MSComctlLib.ListViewCtrl.2 (may trigger CVE-2012-0158)",
    ),
    (
        guid!("C74190B6-8589-11D1-B16A-00C0F0283628"),
        "MSComctlLib.TreeCtrl.2 (may trigger CVE-2012-0158)",
    ),
    (
        guid!("DD9DA666-8594-11D1-B16A-00C0F0283628"),
        "MSComctlLib.ImageComboCtrl.2 (may trigger CVE-2014-1761)",
    ),
    (
        guid!("1461A561-24E8-4BA3-8D4A-FFEEF980556B"),
        "BCSAddin.Connect, library not registered (CVE-2016-0042)",
    ),
    (
        guid!("05741520-C4EB-440A-AC3F-9A2B5F0A8B1E"),
        "Microsoft.Office.WebExtension.Connect (CVE-2015-1641 heap spray)",
    ),
    (
        guid!("00021401-0000-0000-C000-000000000046"),
        "Windows LNK shortcut",
    ),
];
