//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailcrypt.
//
// Mailcrypt is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcrypt is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcrypt. If not, see <http://www.gnu.org/licenses/>.

use bitflags::bitflags;

bitflags! {
    /// The security state of a message or part.
    ///
    /// While composing these are the user's requests; on a decoded message
    /// they accumulate what was found.
    #[derive(Default)]
    pub struct SecurityFlags: u16 {
        const ENCRYPT = 1 << 0;
        const SIGN = 1 << 1;
        const GOODSIGN = 1 << 2;
        const BADSIGN = 1 << 3;
        /// Only some of the parts are signed.
        const PARTSIGN = 1 << 4;
        const SIGNOPAQUE = 1 << 5;
        const KEYBLOCK = 1 << 6;
        const INLINE = 1 << 7;
        const OPPENCRYPT = 1 << 8;
        const AUTOCRYPT = 1 << 9;
        /// `AUTOCRYPT` was set by the user rather than by recommendation.
        const AUTOCRYPT_OVERRIDE = 1 << 10;
        const APPLICATION_PGP = 1 << 11;
        const APPLICATION_SMIME = 1 << 12;
        /// Inline PGP detection has already been run on the message.
        const TRADITIONAL_CHECKED = 1 << 13;

        const PGP_ENCRYPT = Self::APPLICATION_PGP.bits | Self::ENCRYPT.bits;
        const PGP_SIGN = Self::APPLICATION_PGP.bits | Self::SIGN.bits;
        const PGP_GOODSIGN = Self::APPLICATION_PGP.bits | Self::GOODSIGN.bits;
        const PGP_KEY = Self::APPLICATION_PGP.bits | Self::KEYBLOCK.bits;
        const PGP_INLINE = Self::APPLICATION_PGP.bits | Self::INLINE.bits;
        const SMIME_ENCRYPT = Self::APPLICATION_SMIME.bits | Self::ENCRYPT.bits;
        const SMIME_SIGN = Self::APPLICATION_SMIME.bits | Self::SIGN.bits;
        const SMIME_GOODSIGN =
            Self::APPLICATION_SMIME.bits | Self::GOODSIGN.bits;
        const SMIME_BADSIGN =
            Self::APPLICATION_SMIME.bits | Self::BADSIGN.bits;
        const SMIME_OPAQUE =
            Self::APPLICATION_SMIME.bits | Self::SIGNOPAQUE.bits;
    }
}

impl SecurityFlags {
    /// Whether any sign or encrypt operation is requested.
    pub fn wants_crypto(self) -> bool {
        self.intersects(SecurityFlags::ENCRYPT | SecurityFlags::SIGN)
    }
}

bitflags! {
    /// Capabilities and restrictions of a key or user id.
    #[derive(Default)]
    pub struct KeyFlags: u32 {
        const CANSIGN = 1 << 0;
        const CANENCRYPT = 1 << 1;
        const ISX509 = 1 << 2;
        const SECRET = 1 << 7;
        const EXPIRED = 1 << 8;
        const REVOKED = 1 << 9;
        const DISABLED = 1 << 10;
        const SUBKEY = 1 << 11;
        const CRITICAL = 1 << 12;
        const PREFER_ENCRYPTION = 1 << 13;
        const PREFER_SIGNING = 1 << 14;

        const CANTUSE = Self::DISABLED.bits | Self::REVOKED.bits
            | Self::EXPIRED.bits;
        const RESTRICTIONS = Self::CANTUSE.bits | Self::CRITICAL.bits;
        const ABILITIES = Self::CANENCRYPT.bits | Self::CANSIGN.bits
            | Self::PREFER_ENCRYPTION.bits | Self::PREFER_SIGNING.bits;
    }
}
